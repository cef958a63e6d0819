//! The enrichment engine contract the worker calls for each claimed item.

use async_trait::async_trait;
use dealflow_shared::{EntityId, QueueItem, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Payload sent to an engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequest {
    pub entity_id: EntityId,
    pub context: Value,
}

impl EngineRequest {
    /// Request for a claimed queue item, carrying its fund, reason and attempt.
    pub fn for_item(item: &QueueItem) -> Self {
        Self {
            entity_id: item.entity_id.clone(),
            context: json!({
                "fundId": item.fund_id.as_str(),
                "triggerReason": item.trigger_reason.as_str(),
                "queueItemId": item.id,
                "attempt": item.attempts,
            }),
        }
    }
}

/// What an engine reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineResponse {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// A named external enrichment capability.
///
/// `Err` means the call itself failed (transport, decoding); a reachable
/// engine that could not enrich returns `Ok` with `success == false`.
#[async_trait]
pub trait EnrichmentEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse>;
}
