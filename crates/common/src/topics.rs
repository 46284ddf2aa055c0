use crate::event_bus::Topic;

// Canonical job lifecycle topics consumed by the notification transport
pub const TOPIC_JOB_STATUS_UPDATE: Topic = Topic("job.status_update");
pub const TOPIC_JOB_COMPLETED: Topic = Topic("job.completed");
pub const TOPIC_JOB_FAILED: Topic = Topic("job.failed");
