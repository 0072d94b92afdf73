//! Glyph Domain - Core domain models and types
//!
//! Catalog entities, opaque identifiers, and the status enums backing the
//! engine's flow/step/work state machines.

pub mod enums;
pub mod ids;
pub mod step;

pub use enums::*;
pub use ids::*;
pub use step::*;
