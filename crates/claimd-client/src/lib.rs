pub mod probe;
pub mod runner;
pub mod sources;

pub use probe::HttpProxyProbe;
pub use runner::CommandTaskRunner;
pub use sources::{FileProxySource, HttpProxySource, ProxySourceKind, StaticProxySource};
