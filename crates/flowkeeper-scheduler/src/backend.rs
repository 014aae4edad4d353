//! Seam to the external flow and broadcast engine.
//!
//! The dispatcher only resolves ids and hands work over; what "starting a batch"
//! or "sending a batch" means is entirely the engine's business.

use async_trait::async_trait;
use flowkeeper_core::error::{FlowkeeperError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const BATCH_START: &str = "BATCH_START";
pub const BATCH_SEND: &str = "BATCH_SEND";

// ── Engine models ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: i64,
    pub org_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_archived: bool,
}

fn default_true() -> bool { true }

impl Flow {
    /// Only active, unarchived flows accept new contacts.
    pub fn is_startable(&self) -> bool {
        self.is_active && !self.is_archived
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: i64,
    pub org_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub id: i64,
    pub org_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStart {
    pub id: i64,
    pub flow_id: i64,
}

/// A fully resolved batch start, as handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartBatch {
    pub flow: Flow,
    pub contacts: Vec<i64>,
    pub broadcasts: Vec<Broadcast>,
    pub started_flows: Vec<i64>,
    pub start_msg: Option<Msg>,
    pub extra: Value,
    pub flow_start: Option<FlowStart>,
}

/// Keyword arguments forwarded to a broadcast batch send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastBatchArgs {
    pub urn_ids: Vec<i64>,
    /// Anything else the producer attached, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Engine traits ──────────────────────────────────────

/// Flow-side operations.
#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn get_flow(&self, flow_id: i64) -> Result<Option<Flow>>;
    async fn get_msg(&self, msg_id: i64) -> Result<Option<Msg>>;
    async fn get_flow_start(&self, start_id: i64) -> Result<Option<FlowStart>>;
    async fn start_batch(&self, batch: &StartBatch) -> Result<()>;
}

/// Broadcast-side operations.
#[async_trait]
pub trait BroadcastEngine: Send + Sync {
    async fn get_broadcast(&self, org_id: i64, broadcast_id: i64) -> Result<Option<Broadcast>>;
    /// Known broadcasts among `ids`; unknown ids are simply absent.
    async fn get_broadcasts(&self, ids: &[i64]) -> Result<Vec<Broadcast>>;
    async fn send_batch(&self, broadcast: &Broadcast, args: &BroadcastBatchArgs) -> Result<()>;
}

// ── Batch queue payloads ───────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartBatchTask {
    pub flow: i64,
    #[serde(default)]
    pub contacts: Vec<i64>,
    #[serde(default)]
    pub broadcasts: Vec<i64>,
    #[serde(default)]
    pub started_flows: Vec<i64>,
    #[serde(default)]
    pub start_msg: Option<i64>,
    #[serde(default)]
    pub extra: Value,
    #[serde(default)]
    pub flow_start: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendBatchTask {
    pub broadcast: i64,
    pub kwargs: BroadcastBatchArgs,
}

/// A task on the batch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchTask {
    Start(StartBatchTask),
    Send(SendBatchTask),
}

impl BatchTask {
    pub fn task_type(&self) -> &'static str {
        match self {
            BatchTask::Start(_) => BATCH_START,
            BatchTask::Send(_) => BATCH_SEND,
        }
    }

    /// The flow or broadcast the task acts on.
    pub fn item_id(&self) -> i64 {
        match self {
            BatchTask::Start(task) => task.flow,
            BatchTask::Send(task) => task.broadcast,
        }
    }

    /// Parse a queued payload. A payload without `task_type` is a batch start.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let task_type = payload
            .get("task_type")
            .and_then(Value::as_str)
            .unwrap_or(BATCH_START);
        match task_type {
            BATCH_START => Ok(BatchTask::Start(serde_json::from_value(payload.clone())?)),
            BATCH_SEND => Ok(BatchTask::Send(serde_json::from_value(payload.clone())?)),
            other => Err(FlowkeeperError::Dispatch(format!("unknown batch task type '{other}'"))),
        }
    }

    pub fn to_payload(&self) -> Result<Value> {
        let mut payload = match self {
            BatchTask::Start(task) => serde_json::to_value(task)?,
            BatchTask::Send(task) => serde_json::to_value(task)?,
        };
        if let Value::Object(map) = &mut payload {
            map.insert("task_type".into(), Value::String(self.task_type().to_string()));
        }
        Ok(payload)
    }
}
