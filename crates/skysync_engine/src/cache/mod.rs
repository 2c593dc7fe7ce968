//! Asset caching for large binary payloads.
//!
//! Payloads of cacheable entities live outside the object, under
//! `cache_dir/<recordName>`, and move between device and remote store on
//! request. Record sync never waits for them.

mod manager;
mod state;

pub use manager::CacheManager;
pub use state::{CacheState, RemoteStatus};
