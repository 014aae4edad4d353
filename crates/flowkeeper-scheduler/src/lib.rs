//! # Flowkeeper Scheduler
//!
//! Lock-guarded periodic maintenance for the messaging-flow engine, plus the
//! consumer side of the batch queue.
//!
//! ## Jobs
//! | Job | Lock TTL | Does |
//! |-----|----------|------|
//! | `check_flows` | 900s | exit expired runs |
//! | `check_flow_timeouts` | 3600s | queue `TIMEOUT_EVENT`s, deduplicated |
//! | `squash_flowpathcounts` | 7200s | fold path counters |
//! | `squash_flowruncounts` | 7200s | fold node/run/category/start counters, prune recent runs |
//! | `trim_flow_sessions` | 900s | delete old ended sessions |
//! | `check_campaigns` | 900s | queue `FIRE_EVENT` batches, deduplicated |
//! | `trim_event_fires` | 900s | delete orphaned and old fires |

pub mod backend;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod http;
pub mod jobs;
pub mod periodic;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BatchTask, BroadcastEngine, FlowEngine};
pub use dispatch::{BatchDispatcher, DispatchOutcome};
pub use engine::{Worker, worker_name};
pub use events::HandlerEvent;
pub use http::HttpEngine;
pub use jobs::{JobKind, JobReport, Jobs};
pub use periodic::{PeriodicScheduler, RunOutcome};
