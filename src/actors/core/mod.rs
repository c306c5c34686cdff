// ============================================================================
// Core Actor Abstractions
// ============================================================================
//
// Health types shared by the infrastructure actors.
//
// ============================================================================

pub mod health;

pub use health::*;
