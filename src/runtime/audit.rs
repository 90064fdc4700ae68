use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use uuid::Uuid;

use crate::errors::{EngineError, Result};

/// 审计事件 (immutable audit record synthesized on task SUCCESS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: String,
    pub event_args: Vec<Value>,
    pub agent: String,
    pub information_package: String,
    pub task_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| EngineError::Persistence("audit log mutex poisoned".to_string()))?
            .push(event);
        Ok(())
    }
}

/// Posts each event as JSON to an external audit service.
#[derive(Debug)]
pub struct HttpAuditSink {
    client: Client,
    url: String,
}

impl HttpAuditSink {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&event)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| EngineError::Other(anyhow::anyhow!("audit sink rejected event {}: {}", event.id, e)))?;
        Ok(())
    }
}
