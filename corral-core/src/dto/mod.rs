//! Data Transfer Objects
//!
//! Payloads exchanged with the remote image registry. They mirror the JSON the
//! registry returns and carry no behaviour beyond decoding.

pub mod registry;
