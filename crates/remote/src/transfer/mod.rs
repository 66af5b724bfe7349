//! Archive transfer primitives: chunked upload and ranged download

pub mod download;
pub mod progress;
pub mod range;
pub mod upload;

pub use download::{download_multi, download_single};
pub use progress::{DisplayTimer, DownloadProgress, ProgressSnapshot};
pub use range::{ByteRange, partition};
pub use upload::upload_chunks;
