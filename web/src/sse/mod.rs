//! SSE HTTP handler for the web layer.
//!
//! This module contains only the Axum handler for the stream endpoint.
//! Registries, publishers and wire framing live in the `sse` crate.

pub mod handler;
