//! HTTP bridge to the flow engine.
//!
//! JSON over HTTP. A 404 on a lookup means "no such entity"; every other
//! non-success status is an upstream failure.

use std::time::Duration;

use async_trait::async_trait;
use flowkeeper_core::config::EngineConfig;
use flowkeeper_core::error::{FlowkeeperError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::backend::{Broadcast, BroadcastBatchArgs, BroadcastEngine, Flow, FlowEngine, FlowStart, Msg, StartBatch};

pub struct HttpEngine {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowkeeperError::upstream(format!("HTTP client init failed: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// `None` when no engine URL is configured.
    pub fn from_config(config: &EngineConfig) -> Result<Option<Self>> {
        match config.base_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Ok(Some(Self::new(url, Duration::from_secs(config.timeout_secs))?)),
            None => Ok(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn lookup<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| FlowkeeperError::upstream(format!("GET {path} failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FlowkeeperError::upstream(format!("GET {path} returned {status}: {body}")));
        }
        let value = resp
            .json()
            .await
            .map_err(|e| FlowkeeperError::upstream(format!("Invalid response from {path}: {e}")))?;
        Ok(Some(value))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| FlowkeeperError::upstream(format!("POST {path} failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FlowkeeperError::upstream(format!("POST {path} returned {status}: {body}")));
        }
        resp.json()
            .await
            .map_err(|e| FlowkeeperError::upstream(format!("Invalid response from {path}: {e}")))
    }
}

#[async_trait]
impl FlowEngine for HttpEngine {
    async fn get_flow(&self, flow_id: i64) -> Result<Option<Flow>> {
        self.lookup(&format!("flows/{flow_id}")).await
    }

    async fn get_msg(&self, msg_id: i64) -> Result<Option<Msg>> {
        self.lookup(&format!("msgs/{msg_id}")).await
    }

    async fn get_flow_start(&self, start_id: i64) -> Result<Option<FlowStart>> {
        self.lookup(&format!("flow_starts/{start_id}")).await
    }

    async fn start_batch(&self, batch: &StartBatch) -> Result<()> {
        let _: serde_json::Value = self.post(&format!("flows/{}/start_batch", batch.flow.id), batch).await?;
        Ok(())
    }
}

#[async_trait]
impl BroadcastEngine for HttpEngine {
    async fn get_broadcast(&self, org_id: i64, broadcast_id: i64) -> Result<Option<Broadcast>> {
        self.lookup(&format!("orgs/{org_id}/broadcasts/{broadcast_id}")).await
    }

    async fn get_broadcasts(&self, ids: &[i64]) -> Result<Vec<Broadcast>> {
        self.post("broadcasts/lookup", &json!({ "ids": ids })).await
    }

    async fn send_batch(&self, broadcast: &Broadcast, args: &BroadcastBatchArgs) -> Result<()> {
        let _: serde_json::Value = self.post(&format!("broadcasts/{}/send_batch", broadcast.id), args).await?;
        Ok(())
    }
}
