//! Training jobs: lifecycle, persistence and the concurrency-limited manager.

pub mod job;
pub mod lock;
pub mod manager;
pub mod store;

pub use job::{INTERRUPTED_MESSAGE, JobRequest, JobStatus, TrainingJob};
pub use lock::StateLock;
pub use manager::{JobEvent, JobManager, JobSlot, NO_SUCCESSFUL_TRIAL};
pub use store::{InMemoryJobStore, JobStore, JsonFileJobStore};
