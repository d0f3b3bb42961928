//! Core types, protocol, config, errors, and conversation store for Threadline.

pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;
