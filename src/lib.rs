//! Patch engine for CRI AWB containers and the AFS2 offset tables their
//! companion assets keep.
//!
//! A run resolves replacement `.hca` files against the lookup tables,
//! groups them by companion asset, and then for each batch rewrites the
//! segments, header blocks and offset tables in place.

pub mod batch;
pub mod cache;
pub mod context;
pub mod editor;
pub mod error;
pub mod extract;
pub mod offsets;
pub mod resolver;
pub mod scanner;
pub mod tables;
pub mod util;

#[cfg(test)]
mod testutil;
