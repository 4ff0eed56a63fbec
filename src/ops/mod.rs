//! Cluster operation data model.
//!
//! An operation is a user-initiated lifecycle action (install, expand,
//! update, ...) with a state machine owned by its plan driver. The core only
//! reads operations; every mutation goes through the driver that created it.

pub mod operator;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use operator::{HttpOperator, Operator};

/// Kind of a cluster lifecycle operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    /// Initial cluster installation
    Install,
    /// Adding a node to an existing cluster
    Expand,
    /// Upgrading the application to a new version
    Update,
    /// Updating the runtime environment on cluster nodes
    UpdateRuntimeEnviron,
    /// Updating the cluster configuration
    UpdateConfig,
    /// Cleaning up state left behind by previous operations
    GarbageCollect,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Install => "install",
            OperationType::Expand => "expand",
            OperationType::Update => "update",
            OperationType::UpdateRuntimeEnviron => "update-runtime-environ",
            OperationType::UpdateConfig => "update-config",
            OperationType::GarbageCollect => "garbage-collect",
        };
        f.write_str(name)
    }
}

/// Progress state of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationState {
    /// The operation is in progress
    Active,
    /// The operation failed; it can still be resumed or rolled back
    Failed,
    /// The operation has finished; this state is terminal
    Completed,
}

/// Identifies a cluster within an account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteKey {
    pub account_id: String,
    pub site_domain: String,
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.site_domain)
    }
}

/// A named collection of member machines managed together.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Site {
    pub key: SiteKey,
    /// Free-form state label reported by the owning service
    #[serde(default)]
    pub state: String,
}

/// A single cluster lifecycle operation.
///
/// The payload is opaque to the core; only the driver that created the
/// operation interprets it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub created: DateTime<Utc>,
    pub state: OperationState,
    pub site: SiteKey,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Operation {
    pub fn is_completed(&self) -> bool {
        self.state == OperationState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == OperationState::Failed
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation({}, {}, created={}, state={:?})",
            self.id, self.op_type, self.created, self.state
        )
    }
}
