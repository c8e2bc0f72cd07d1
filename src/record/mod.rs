//! Evidence capture: frame buffering, encoding and incident directories.

pub mod encode;
pub mod recorder;
pub mod ring_buffer;

pub use recorder::{EvidenceFrames, IncidentMetadata, IncidentRecorder};
pub use ring_buffer::{BufferInfo, BufferedFrame, RingBuffer};
