//! Background synchronization between the local cache and the bucket.

mod engine;
mod events;

pub use engine::{EngineOptions, SyncEngine};
pub use events::{channel, SyncHandle, SyncRequest};
