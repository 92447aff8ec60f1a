//! Cross-crate end-to-end scenarios for the sonar discovery server.
//!
//! The actual tests live under `tests/`; this crate exists so they can
//! depend on every workspace crate at once.
