pub mod errors;
pub mod event_bus;
pub mod logging;
pub mod scheduler;
pub mod topics;

pub use errors::{
    PipelineError, ProviderError, ProviderErrorKind, StorageError, ValidationError,
};
pub use event_bus::{EventBus, EventEnvelope, Topic};
pub use scheduler::{ScheduledTask, Scheduler, TaskId};
