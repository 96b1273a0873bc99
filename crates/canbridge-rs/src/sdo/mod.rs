// crates/canbridge-rs/src/sdo/mod.rs

//! Service Data Object protocol: expedited and segmented reads and writes
//! against a device index/sub-index, layered on the CAN I/O queues.

pub mod client;
pub mod frame;

pub use client::SdoWriteResult;
pub use frame::{SdoResponse, abort};
