mod frame_logger;
mod reject_create_topics;

pub use frame_logger::{FrameLogger, FrameLoggerFactory};
pub use reject_create_topics::{RejectCreateTopics, RejectCreateTopicsFactory};
