//! Status and conditions management for PostgresCluster resources
//!
//! This module provides utilities for managing Kubernetes-style conditions
//! and for turning a status change into a merge patch.

use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::controller::error::Result;
use crate::crd::{Condition, PostgresClusterStatus};

/// Condition types maintained by the operator
pub mod condition_types {
    /// The pgBackRest stanza exists and the repository accepts backups
    pub const BACKUP_REPO_READY: &str = "BackupRepoReady";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't. The
    /// transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Drop a condition that no longer applies
    pub fn remove_condition(mut self, type_: &str) -> Self {
        self.conditions.retain(|c| c.type_ != type_);
        self
    }

    /// Set the BackupRepoReady condition
    pub fn backup_repo_ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        let status = if is_ready {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::BACKUP_REPO_READY, status, reason, message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Merge patch turning `before` into `after`. Fields that disappeared are
/// set to null so the server removes them.
fn diff(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (k, v) in new {
                let value = match old.get(k) {
                    Some(prev) => diff(prev, v),
                    None => v.clone(),
                };
                patch.insert(k.clone(), value);
            }
            for k in old.keys() {
                if !new.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        (_, new) => new.clone(),
    }
}

/// Body of the status merge patch, conditional on `resource_version`
pub fn status_patch(
    before: Option<&PostgresClusterStatus>,
    after: &PostgresClusterStatus,
    resource_version: Option<String>,
) -> Result<Value> {
    let old = match before {
        Some(status) => serde_json::to_value(status)?,
        None => json!({}),
    };
    let new = serde_json::to_value(after)?;
    Ok(json!({
        "metadata": { "resourceVersion": resource_version },
        "status": diff(&old, &new),
    }))
}
