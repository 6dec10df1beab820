//! Result export
//!
//! This module writes a finished result series to disk.
//! Two formats are supported:
//! - JSON document with configuration summary and every round
//! - Attribute tree: one file per quantity, one value per line per round

pub mod attributes;
pub mod json;

pub use attributes::write_attribute_tree;
pub use json::JsonExporter;
