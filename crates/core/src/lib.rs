//! Domain types and pure logic for the ad image generation engine.
//!
//! Everything in this crate is free of I/O except the step statistics
//! table, which persists itself to a small JSON file. The pipeline, worker
//! and API crates all build on these types.

pub mod artifact;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod job;
pub mod progress;
pub mod protocol;
pub mod request;
pub mod stats;
pub mod step;
pub mod types;
