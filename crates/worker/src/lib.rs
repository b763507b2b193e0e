//! Serverless job worker for a local ComfyUI instance.
//!
//! [`handler::JobHandler`] turns one job input into one result mapping.
//! [`server`] exposes it over HTTP, one job at a time.

pub mod config;
pub mod handler;
pub mod server;
pub mod staging;
