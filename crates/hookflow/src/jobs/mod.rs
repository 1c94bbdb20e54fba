pub mod dispatcher;
pub mod error_codes;
pub mod handlers;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod pool;
pub mod queue;
pub mod repo;
pub mod retry;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error_codes::ErrorCode;
pub use handlers::{HandlerRegistry, JobContext};
pub use memory::MemoryStore;
pub use metrics::Metrics;
pub use model::{Job, JobError, JobStatus, LogEntry, NewJob};
pub use notifier::CompletionNotifier;
pub use pool::{SlotOutcome, WorkerPool, WorkerPoolConfig};
pub use queue::{JobQueue, WaitError};
pub use repo::JobsRepo;
pub use retry::RetryConfig;
pub use store::{JobStore, Reclaimed, StatusCounts, StoreError};
