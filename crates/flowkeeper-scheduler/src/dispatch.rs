//! Batch dispatcher: consumes the batch queue and drives the engine.

use std::sync::Arc;
use std::time::Instant;

use flowkeeper_core::error::{FlowkeeperError, Result};
use flowkeeper_store::{QueuedTask, TaskQueue};

use crate::backend::{
    BatchTask, BroadcastEngine, FlowEngine, SendBatchTask, StartBatch, StartBatchTask,
};

/// What one dispatch attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Nothing queued.
    Idle,
    Started { flow_id: i64, contacts: usize },
    Sent { broadcast_id: i64, urns: usize },
    /// The referenced flow or broadcast no longer exists or cannot be used.
    Skipped(String),
}

/// Releases the popped partition exactly once, however dispatch ends.
///
/// The normal path awaits `release`; if the dispatch future unwinds or is
/// dropped first, `Drop` hands the release to the blocking pool instead.
struct PartitionGuard {
    queue: TaskQueue,
    name: String,
    org_id: i64,
    armed: bool,
}

impl PartitionGuard {
    async fn release(mut self) {
        self.armed = false;
        let (queue, name, org_id) = (self.queue.clone(), self.name.clone(), self.org_id);
        if let Err(e) = tokio::task::spawn_blocking(move || complete_partition(&queue, &name, org_id)).await {
            tracing::error!("❌ Completing {} partition of org {} aborted: {e}", self.name, org_id);
        }
    }
}

impl Drop for PartitionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (queue, name, org_id) = (self.queue.clone(), std::mem::take(&mut self.name), self.org_id);
        let complete = move || complete_partition(&queue, &name, org_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(complete);
            }
            Err(_) => complete(),
        }
    }
}

fn complete_partition(queue: &TaskQueue, name: &str, org_id: i64) {
    if let Err(e) = queue.complete(name, org_id) {
        tracing::error!("❌ Failed to complete {} task for org {}: {e}", name, org_id);
    }
}

pub struct BatchDispatcher {
    queue: TaskQueue,
    queue_name: String,
    flows: Arc<dyn FlowEngine>,
    broadcasts: Arc<dyn BroadcastEngine>,
}

impl BatchDispatcher {
    pub fn new(
        queue: TaskQueue,
        queue_name: impl Into<String>,
        flows: Arc<dyn FlowEngine>,
        broadcasts: Arc<dyn BroadcastEngine>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            flows,
            broadcasts,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Pop and execute the next batch task, if any.
    pub async fn dispatch_next(&self) -> Result<DispatchOutcome> {
        let (queue, name) = (self.queue.clone(), self.queue_name.clone());
        let popped = tokio::task::spawn_blocking(move || queue.pop_next(&name))
            .await
            .map_err(|e| FlowkeeperError::Dispatch(format!("queue pop aborted: {e}")))??;
        let Some(task) = popped else {
            return Ok(DispatchOutcome::Idle);
        };

        let guard = PartitionGuard {
            queue: self.queue.clone(),
            name: self.queue_name.clone(),
            org_id: task.org_id,
            armed: true,
        };
        let result = self.execute(&task).await;
        guard.release().await;
        result
    }

    async fn execute(&self, task: &QueuedTask) -> Result<DispatchOutcome> {
        let started = Instant::now();
        let batch = match BatchTask::from_payload(&task.payload) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("❌ Unreadable batch task for org {}: {e} payload={}", task.org_id, task.payload);
                return Err(e);
            }
        };

        let result = match &batch {
            BatchTask::Start(start) => self.start_batch(start).await,
            BatchTask::Send(send) => self.send_batch(task.org_id, send).await,
        };

        match &result {
            Ok(DispatchOutcome::Started { flow_id, contacts }) => tracing::info!(
                "🚀 Started batch of {} contacts in flow {} [{}] in {:?}",
                contacts, flow_id, task.org_id, started.elapsed()
            ),
            Ok(DispatchOutcome::Sent { broadcast_id, urns }) => tracing::info!(
                "📨 Sent batch of {} messages in broadcast {} [{}] in {:?}",
                urns, broadcast_id, task.org_id, started.elapsed()
            ),
            Ok(DispatchOutcome::Skipped(reason)) => tracing::warn!(
                "⚠️ Skipped {} {} for org {}: {}",
                batch.task_type(), batch.item_id(), task.org_id, reason
            ),
            Ok(DispatchOutcome::Idle) => {}
            Err(e) => tracing::error!(
                "❌ {} {} for org {} failed after {:?}: {e} payload={}",
                batch.task_type(), batch.item_id(), task.org_id, started.elapsed(), task.payload
            ),
        }
        result
    }

    async fn start_batch(&self, task: &StartBatchTask) -> Result<DispatchOutcome> {
        let flow = match self.flows.get_flow(task.flow).await? {
            Some(flow) if flow.is_startable() => flow,
            Some(_) => return Ok(DispatchOutcome::Skipped(format!("flow {} is inactive or archived", task.flow))),
            None => return Ok(DispatchOutcome::Skipped(format!("flow {} not found", task.flow))),
        };

        let broadcasts = if task.broadcasts.is_empty() {
            Vec::new()
        } else {
            self.broadcasts.get_broadcasts(&task.broadcasts).await?
        };
        let start_msg = match task.start_msg {
            Some(id) => self.flows.get_msg(id).await?,
            None => None,
        };
        let flow_start = match task.flow_start {
            Some(id) => self.flows.get_flow_start(id).await?,
            None => None,
        };

        let batch = StartBatch {
            flow,
            contacts: task.contacts.clone(),
            broadcasts,
            started_flows: task.started_flows.clone(),
            start_msg,
            extra: task.extra.clone(),
            flow_start,
        };
        self.flows.start_batch(&batch).await?;
        Ok(DispatchOutcome::Started {
            flow_id: batch.flow.id,
            contacts: batch.contacts.len(),
        })
    }

    async fn send_batch(&self, org_id: i64, task: &SendBatchTask) -> Result<DispatchOutcome> {
        let Some(broadcast) = self.broadcasts.get_broadcast(org_id, task.broadcast).await? else {
            return Ok(DispatchOutcome::Skipped(format!(
                "broadcast {} not found in org {}",
                task.broadcast, org_id
            )));
        };
        self.broadcasts.send_batch(&broadcast, &task.kwargs).await?;
        Ok(DispatchOutcome::Sent {
            broadcast_id: broadcast.id,
            urns: task.kwargs.urn_ids.len(),
        })
    }
}
