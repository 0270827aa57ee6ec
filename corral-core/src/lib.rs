//! Corral Core
//!
//! Core types shared by the Corral runner fleet manager.
//!
//! This crate contains:
//! - Domain types: images, worker containers, structured worker log lines
//! - DTOs: wire payloads of the remote image registry API

pub mod domain;
pub mod dto;
