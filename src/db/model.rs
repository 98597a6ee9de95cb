//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in the generator and worker.

use chrono::{DateTime, Utc};

/// A sketch sitting in `processing` with no live job behind it.
#[derive(Debug, Clone)]
pub struct StuckSketch {
    pub id: i64,
    pub updated_at: DateTime<Utc>,
}

/// Queue depth snapshot used for progress logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: i64,
    pub dead: i64,
}
