//! Scheduler de jobs del lado cliente: parte la entrada en segmentos, los
//! reparte entre los workers según localidad y entrega los resultados.

pub mod buckets;
pub mod channel;
pub mod coordinator;
pub mod job;
pub mod process;
pub mod scheduler;
pub mod workers;

#[cfg(test)]
mod testing;

pub use channel::{DataChannel, ProgressEvent, TcpDataChannel};
pub use coordinator::{master_base_url, Coordinator, HttpCoordinator};
pub use process::{BucketOutput, OutputSpec, ReadResult, SphereProcess};
