//! The synchronization pipeline: job lifecycle, chunked parallel uploads
//! with retry, payload shrinking, and the event publishing side-channel.

pub mod client;
pub mod events;
pub mod pipeline;
pub mod shrink;

pub use client::{HttpSyncClient, SyncClient};
pub use events::{EventPublisher, EventPublisherHandle};
pub use pipeline::{
    synchronize_collected_data, upload_collected_data, upload_data_chunk, upload_graph_object_data,
    RetryPolicy, UploadSink, UPLOAD_BATCH_SIZE, UPLOAD_CONCURRENCY,
};
pub use shrink::{shrink_raw_data, ShrinkResult, UPLOAD_SIZE_MAX};
