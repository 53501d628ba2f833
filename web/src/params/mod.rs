//! Typed parameters for endpoint inputs.
//!
//! Request bodies are deserialized straight into these structs, so malformed
//! input is rejected by the extractor before any handler code runs.

pub(crate) mod event;
