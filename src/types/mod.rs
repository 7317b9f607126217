//! Core data types for the REM database.

pub mod entity;
pub mod error;

pub use entity::{Edge, Entity, SystemFields};
pub use error::{DatabaseError, Result};
