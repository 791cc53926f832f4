//! Scrubline Core Library
//!
//! Background media processing for a media server:
//! - Heatmap analysis (loudness + motion series) driven by an ffmpeg subprocess
//! - In-flight job coalescing and progress lookup
//! - Content-addressed disk cache for computed heatmaps
//! - Admission control for transcode subprocesses
//! - A restartable request/response RPC client for isolated worker processes
//!
//! Nothing in here owns a network socket. The HTTP layer (or the CLI) constructs
//! a [`services::CoreServices`] and calls into it.

pub mod admission;
pub mod ffmpeg;
pub mod fs;
pub mod heatmap;
pub mod jobs;
pub mod process;
pub mod rpc;
pub mod services;
pub mod settings;

mod types;
pub use types::*;

mod error;
pub use error::*;
