use std::collections::BTreeMap;
use std::sync::Mutex;

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use aiproxy_common::ProxyError;

use crate::error::{ApiError, ApiResult};
use crate::state::ManagementState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageRecord {
    fn merge(&mut self, other: &UsageRecord) {
        self.requests += other.requests;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// In-process usage totals keyed by provider and model. Snapshots are whole
/// copies; import merges by summation so two instances can be combined.
#[derive(Default)]
pub struct UsageStore {
    records: Mutex<BTreeMap<(String, String), UsageRecord>>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, model: &str, input_tokens: u64, output_tokens: u64) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        let entry = records
            .entry((provider.to_string(), model.to_string()))
            .or_default();
        entry.requests += 1;
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
    }

    pub fn snapshot(&self) -> Value {
        let records = match self.records.lock() {
            Ok(records) => records,
            Err(_) => return json!({ "providers": {} }),
        };
        let mut providers: BTreeMap<String, BTreeMap<String, UsageRecord>> = BTreeMap::new();
        for ((provider, model), record) in records.iter() {
            providers
                .entry(provider.clone())
                .or_default()
                .insert(model.clone(), *record);
        }
        json!({ "providers": providers })
    }

    pub fn import(&self, snapshot: &Value) -> Result<usize, ProxyError> {
        let providers = snapshot
            .get("providers")
            .and_then(Value::as_object)
            .ok_or_else(|| ProxyError::invalid("snapshot missing 'providers'"))?;
        let mut imported = 0usize;
        let mut records = self
            .records
            .lock()
            .map_err(|_| ProxyError::internal("usage store lock poisoned"))?;
        for (provider, models) in providers {
            let Some(models) = models.as_object() else {
                continue;
            };
            for (model, record) in models {
                let Ok(record) = serde_json::from_value::<UsageRecord>(record.clone()) else {
                    continue;
                };
                records
                    .entry((provider.clone(), model.clone()))
                    .or_default()
                    .merge(&record);
                imported += 1;
            }
        }
        Ok(imported)
    }
}

pub async fn statistics(State(state): State<ManagementState>) -> Json<Value> {
    Json(state.usage.snapshot())
}

pub async fn export(State(state): State<ManagementState>) -> Json<Value> {
    Json(json!({ "status": "ok", "snapshot": state.usage.snapshot() }))
}

#[derive(Debug, Deserialize)]
pub struct ImportBody {
    pub snapshot: Value,
}

pub async fn import(
    State(state): State<ManagementState>,
    Json(body): Json<ImportBody>,
) -> ApiResult<Json<Value>> {
    let imported = state.usage.import(&body.snapshot).map_err(ApiError)?;
    Ok(Json(json!({ "status": "ok", "imported": imported })))
}
