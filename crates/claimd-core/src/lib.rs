pub mod challenge;
pub mod circuit_breaker;
pub mod classifier;
pub mod error;
pub mod job;
pub mod proxy_pool;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod state;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod throttle;
pub mod traits;

pub use challenge::{ChallengeLedger, ChallengeLedgerConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classifier::{ErrorCategory, FailureSignal, classify, classify_result};
pub use error::AppError;
pub use job::{Job, JobContext, JobKey, JobSpec, TaskResult};
pub use proxy_pool::{ProxyAddress, ProxyPool, ProxyPoolConfig};
pub use reporter::{SchedulerEvent, SchedulerReporter, TracingReporter};
pub use retry::{RetryAction, RetryPolicy, RetryPolicyConfig};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerHandle};
pub use state::{JsonFileStore, StateSnapshot};
pub use traits::{Clock, ProxyProbe, ProxySource, StateStore, SystemClock, TaskRunner};
