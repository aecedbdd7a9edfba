//! The two ways a run turns a camera into footage: timed still frames, or a
//! bounded slice of a live stream.

mod images;
mod segment;

pub use images::ImageCaptureLoop;
pub use segment::VideoSegmentCapture;
