//! Schema registry with JSON-Schema-driven indexing extensions.

pub mod builtin;
pub mod registry;
pub mod validator;

pub use registry::{Schema, SchemaExtensions, SchemaRegistry};
pub use validator::SchemaValidator;

/// Schema short-name of moment entities (time-indexed).
pub const MOMENT_SCHEMA: &str = "moment";

/// Reserved schema name carried by edge operations in the WAL.
pub const EDGE_SCHEMA: &str = "$edge";
