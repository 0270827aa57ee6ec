//! Core domain types
//!
//! These types describe what the fleet controller reasons about: which runner
//! image to use, which worker containers it started, and what those workers
//! print on their log streams.

pub mod image;
pub mod log;
pub mod worker;
