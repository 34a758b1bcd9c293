// Receiver stack: cached engines over long-lived partition readers
pub mod cache;
pub mod cursor;
pub mod partition_reader;
pub mod perf;

pub use cache::ReceiverCache;
pub use cursor::CursorEngine;
pub use partition_reader::PartitionReader;
pub use perf::{
    DriverEndpoint, PartitionPerformanceMetric, PerfReporter, PARTITION_PERFORMANCE_RECEIVER,
};
