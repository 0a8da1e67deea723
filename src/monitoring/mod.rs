//! Run Monitoring
//!
//! - [`ExecutionTimeline`]: call attempt start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
