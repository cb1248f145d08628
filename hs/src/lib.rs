//! HiveStore - generic record persistence for the hive control plane
//!
//! Records are stored as JSON documents keyed by `(collection, id)`. Each
//! record also publishes a small set of indexed fields which back the
//! status-filtered queries the control plane runs every tick.
//!
//! # Architecture
//!
//! ```text
//! .hive/
//! └── hive.db              # SQLite (WAL)
//!     ├── records          # collection, id, data (json), updated_at
//!     └── record_indexes   # collection, id, field, value_str, value_int
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hivestore::{Filter, Store};
//!
//! let mut store = Store::open(".hive")?;
//! store.create(story)?;
//! let planned: Vec<Story> = store.list(&[Filter::eq("status", "planned")])?;
//! store.transaction(|tx| {
//!     tx.update(story)?;
//!     tx.update(agent)
//! })?;
//! ```

mod record;
mod store;

pub use record::{Filter, FilterOp, IndexValue, Record};
pub use store::{DB_FILE, Store, Tx};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
