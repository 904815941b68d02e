//! Persistent tasks with typed stages.
//!
//! A [`TaskHandler`] is a state machine over its `Stage` type. Every
//! transition is written to the task row before the next stage runs, so a
//! restarted control plane picks tasks up where they stopped.

use std::fmt::Debug;

use async_trait::async_trait;
use kubefleet_apis::UserCred;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

mod scheduler;

pub use scheduler::{TaskScheduler, TaskSchedulerBuilder};

/// What a stage asks the scheduler to do next.
#[derive(Debug, PartialEq)]
pub enum Step<S> {
    Complete,
    /// Continue on the worker pool.
    Next(S),
    /// Continue off the worker pool. Local stages do not survive a restart.
    Local(S),
    /// Park until every child terminates, then continue with `next`. A
    /// failed child fails the task with the child's reason.
    Wait { next: S, children: Vec<TaskSpec> },
}

impl<S: Serialize> Step<S> {
    fn erase(self) -> Result<Step<Value>> {
        Ok(match self {
            Step::Complete => Step::Complete,
            Step::Next(s) => Step::Next(serde_json::to_value(s)?),
            Step::Local(s) => Step::Local(serde_json::to_value(s)?),
            Step::Wait { next, children } => Step::Wait {
                next: serde_json::to_value(next)?,
                children,
            },
        })
    }
}

/// A task to be queued.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSpec {
    pub name: &'static str,
    pub owner_kind: &'static str,
    pub owner_id: String,
    pub params: Value,
    pub stage: Value,
    pub user_cred: UserCred,
}

impl TaskSpec {
    pub fn new<H: TaskHandler>(owner_id: &str, params: &H::Params, user_cred: UserCred) -> Result<Self> {
        Ok(Self {
            name: H::NAME,
            owner_kind: H::OWNER_KIND,
            owner_id: owner_id.to_string(),
            params: serde_json::to_value(params)?,
            stage: serde_json::to_value(H::Stage::default())?,
            user_cred,
        })
    }
}

/// Per-run view of a task handed to its handler.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub task_id: String,
    pub owner_id: String,
    pub user_cred: UserCred,
    /// Cancelled when the control plane shuts down.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    const NAME: &'static str;

    /// Table of the row the task owns.
    const OWNER_KIND: &'static str;

    type Params: Serialize + DeserializeOwned + Send + Sync;

    /// The default value is the initial stage.
    type Stage: Serialize + DeserializeOwned + Default + Debug + Send + Sync;

    async fn run(
        &self,
        ctx: &TaskContext,
        params: &Self::Params,
        stage: Self::Stage,
    ) -> Result<Step<Self::Stage>>;

    /// Records the failure on the owner.
    async fn on_failure(&self, _ctx: &TaskContext, _params: &Self::Params, _reason: &str) {}
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext, params: &Value, stage: &Value) -> Result<Step<Value>>;

    async fn on_failure(&self, ctx: &TaskContext, params: &Value, reason: &str);
}

struct Erased<H>(H);

#[async_trait]
impl<H: TaskHandler> ErasedHandler for Erased<H> {
    async fn run(&self, ctx: &TaskContext, params: &Value, stage: &Value) -> Result<Step<Value>> {
        let params: H::Params = serde_json::from_value(params.clone())?;
        let stage: H::Stage = serde_json::from_value(stage.clone())?;
        debug!("task {}({}) enters stage {:?}", H::NAME, ctx.task_id, stage);
        self.0.run(ctx, &params, stage).await?.erase()
    }

    async fn on_failure(&self, ctx: &TaskContext, params: &Value, reason: &str) {
        match serde_json::from_value::<H::Params>(params.clone()) {
            Ok(params) => self.0.on_failure(ctx, &params, reason).await,
            Err(e) => error!(
                "task {}({}) has unreadable params: {}",
                H::NAME,
                ctx.task_id,
                e
            ),
        }
    }
}
