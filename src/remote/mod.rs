mod client;
mod error;
pub mod provider;
pub mod retry;
mod stream;
mod zone;

pub use client::DEFAULT_REQUEST_TIMEOUT;
pub use error::{ErrorClass, RemoteError, RemoteResult};
pub use provider::{
    CursorStream, DeltaZone, IdPage, RecordKey, StatusRecord, StatusSender, StreamFilter,
    StreamResource, ZoneChanges, ZoneRecord,
};
pub use retry::{send_chunked, with_retry, ChunkReport, RetryPolicy};
pub use stream::HttpStreamProvider;
pub use zone::HttpZoneProvider;
