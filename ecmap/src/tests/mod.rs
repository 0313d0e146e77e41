//! Internal tests module
//!
//! Multi-node tests over the in-process transport, with full access to
//! crate internals.
