//! Common utilities for Glyph
//!
//! Provides shared configuration, error handling, and telemetry.

pub mod telemetry;

pub use telemetry::init_tracing;
