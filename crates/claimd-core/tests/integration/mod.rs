pub mod common;
mod persistence_tests;
mod scheduler_tests;
