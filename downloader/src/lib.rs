//! Smasher native downloader.
//!
//! Direct HTTP downloads split into concurrent byte-range fetches that write
//! into one pre-allocated file, with periodic progress sampling and
//! cooperative cancellation.

pub mod probe;
pub mod segment;
pub mod segmented;

pub use probe::probe_size;
pub use segment::{effective_parts, plan_ranges, ByteRange, MAX_PARTS};
pub use segmented::{SegmentedDownloader, DEFAULT_REPORT_INTERVAL, MIN_REPORT_INTERVAL};
