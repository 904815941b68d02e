use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ObjectBase, Record, UserCred};

closed_enum! {
    pub enum TaskStatus {
        Queued => "queued",
        Running => "running",
        /// Parked until its children terminate.
        Waiting => "waiting",
        Complete => "complete",
        Failed => "failed",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

/// Persistent state of one task. `stage` and `params` are the serialized
/// forms of the handler's typed stage and parameters.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub base: ObjectBase,
    pub owner_kind: String,
    pub owner_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub stage: Value,
    pub params: Value,
    pub user_cred: UserCred,
    pub status: TaskStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Children not yet terminated.
    #[serde(default)]
    pub pending_children: u32,
    /// Failure reasons of terminated children.
    #[serde(default)]
    pub child_failures: Vec<String>,
    /// Whether the current stage runs off-queue as a local task.
    #[serde(default)]
    pub local: bool,
}

impl Record for TaskRecord {
    const KIND: &'static str = "tasks";

    fn id(&self) -> &str {
        &self.base.id
    }

    fn name(&self) -> &str {
        &self.base.name
    }
}

impl TaskRecord {
    pub fn ident(&self) -> String {
        format!("{}({}) of {} {}", self.base.name, self.base.id, self.owner_kind, self.owner_id)
    }
}
