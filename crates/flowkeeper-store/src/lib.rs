//! # Flowkeeper Store
//!
//! Every coordination primitive lives in one shared SQLite file that each worker
//! process opens on its own. Nothing is shared through process memory.
//!
//! ## Layout
//! ```text
//! Store (WAL, busy_timeout)
//!   ├── LockStore     locks                    TTL mutex, atomic upsert
//!   ├── DedupRecord   dedup_entries            day-bucketed fingerprints
//!   ├── TaskQueue     queue_tasks/partitions   FIFO per org, active counts
//!   ├── RunStore      flows, flow_runs         expiry / timeout / exit
//!   ├── SessionStore  flow_sessions
//!   ├── CounterStore  flow_counts, recent runs squash + prune
//!   └── FireStore     event_fires
//! ```
//!
//! Components only touch their own tables; callers compose them.

pub mod counts;
pub mod db;
pub mod dedup;
pub mod fires;
pub mod lock;
pub mod queue;
pub mod runs;
pub mod sessions;

pub use counts::{CounterKey, CounterKind, CounterStore, SquashResult};
pub use db::Store;
pub use dedup::{DedupRecord, Fingerprint};
pub use fires::{DueFire, EventFire, FireStore, NewFire};
pub use lock::{LockEntry, LockOutcome, LockStore, LockToken};
pub use queue::{PartitionStats, QueuedTask, TaskQueue};
pub use runs::{ExitType, FlowRun, NewRun, PathStep, RunStore, TimeoutCandidate};
pub use sessions::SessionStore;
