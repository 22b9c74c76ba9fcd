pub mod api;
pub mod config;
pub mod error;
pub mod protocol;
pub mod segment;
pub mod shuffle;
pub mod stream;
pub mod topology;

pub use api::*;
pub use config::SchedulerConfig;
pub use error::{Result, SphereError};
pub use segment::{
    DataSegment, SegmentId, SegmentOutcome, SegmentResult, SegmentStatus, UnitSizeLimits,
};
pub use stream::{StreamDescriptor, StreamFile};
pub use topology::{Endpoint, Topology};

pub type JobId = String;
pub type WorkerId = String;
pub type SlotId = usize;
pub type SessionId = i32;

/// Id nuevo para un job (sólo se usa para logs y nombres de salida).
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}
