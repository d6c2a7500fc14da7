//! Range streaming engine
//!
//! Split into the pure range/chunk arithmetic ([`range`]) and the failover
//! streaming driver ([`engine`]) that feeds HTTP response bodies.

pub mod engine;
pub mod range;

pub use engine::{body_for, StreamRequest};
pub use range::{chunk_align, content_range, parse_range, ByteRange, ChunkPlan, RangeError};
