//! ComfyUI REST client library.
//!
//! Provides the HTTP API wrapper for a local ComfyUI instance, typed
//! history records, the [`engine::ExecutionEngine`] abstraction, and the
//! readiness and completion polling loops used by the job worker.

pub mod api;
pub mod engine;
pub mod history;
pub mod poll;
pub mod readiness;
