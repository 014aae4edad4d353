//! Payloads pushed to the event-handler queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task name every handler-queue payload is pushed under.
pub const HANDLE_EVENT_TASK: &str = "handle_event_task";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandlerEvent {
    #[serde(rename = "TIMEOUT_EVENT")]
    Timeout { run: i64, timeout_on: DateTime<Utc> },
    #[serde(rename = "FIRE_EVENT")]
    Fire { fires: Vec<i64> },
}
