//! HTTP handlers. Each one validates its parameters and delegates to the
//! [`SyncEngine`](crate::engine::SyncEngine).

pub mod admin;
pub mod deletion;
pub mod devices;
pub mod dump;
pub mod params;
pub mod sync;
