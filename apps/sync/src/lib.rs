//! Client-side synchronization layer for the Templar API.
//!
//! - [`client`]: deduplicated, cached, auth-refreshing HTTP calls
//! - [`stream`]: server-sent event subscriptions with polling fallback
//! - [`notifications`]: the optimistic notification store
//! - [`storage`]: persisted credentials and small cache blobs

pub mod client;
pub mod config;
pub mod errors;
pub mod notifications;
pub mod storage;
pub mod stream;

pub use client::{ClientEvent, ClientOptions, RequestClient, RequestConfig};
pub use errors::{ApiError, ErrorKind, StorageError};
pub use notifications::{NotificationStore, StoreOptions};
pub use storage::Storage;
pub use stream::{StreamHandle, StreamObserver, StreamOptions, StreamTransport};
