//! Domain logic for the ComfyUI serverless worker.
//!
//! Everything in this crate is free of network I/O: job input decoding,
//! workflow graph parsing, typed parameter patching, seed normalization
//! and workflow profiles. The HTTP side lives in `podgen-comfyui`.

pub mod error;
pub mod job;
pub mod patch;
pub mod profile;
pub mod seed;
pub mod workflow;
