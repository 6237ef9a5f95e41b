//! Motion sources: table/stream row parsing and the per-motor bounded
//! queue that feeds the drive interpolation FIFO.

pub mod parser;
pub mod queue;

pub use parser::{parse_stream_row, parse_table_row, RowError, StreamRow, TableRow};
pub use queue::{HomingParams, MotionQueue, QueueError, Sample, StreamSample};
