//! Database module: row models and SQL repositories.
//!
//! - `model`: view models returned by queries that are not whole domain entities.
//! - `repo`: SQL-only functions over the `sketches` and `thumbnail_jobs` tables.
//!
//! Callers import from `sketch_thumbnailer::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{JobCounts, StuckSketch};
