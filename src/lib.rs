//! Realtime synchronization for clinic clients: one push channel carrying
//! broadcast queue state, and per-room message logs reconciled from a
//! realtime document store.

pub mod common;
pub mod config;
pub mod error;
pub mod network;
pub mod storage;
pub mod sync;

pub use error::{Result, SyncError};
