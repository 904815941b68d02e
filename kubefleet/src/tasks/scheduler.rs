use std::{collections::HashMap, sync::Arc};

use kubefleet_apis::{ObjectBase, TaskRecord, TaskStatus};
use serde_json::Value;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use super::{Erased, ErasedHandler, Step, TaskContext, TaskHandler, TaskSpec};
use crate::{
    errors::{Error, Result},
    locks::LockManager,
    metrics::Metrics,
    providers::{AuditEvent, AuditSink},
    store::{Query, Store, StoreExt},
};

const INTERRUPTED: &'static str = "interrupted by restart";

pub struct TaskSchedulerBuilder {
    store: Arc<dyn Store>,
    locks: LockManager,
    audit: Arc<dyn AuditSink>,
    metrics: Metrics,
    workers: usize,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl TaskSchedulerBuilder {
    pub fn new(
        store: Arc<dyn Store>,
        locks: LockManager,
        audit: Arc<dyn AuditSink>,
        metrics: Metrics,
        workers: usize,
    ) -> Self {
        Self {
            store,
            locks,
            audit,
            metrics,
            workers,
            handlers: HashMap::new(),
        }
    }

    pub fn register<H: TaskHandler>(mut self, handler: H) -> Result<Self> {
        if self.handlers.contains_key(H::NAME) {
            return Err(Error::Conflict(format!(
                "task {} already registered",
                H::NAME
            )));
        }
        self.handlers.insert(H::NAME, Arc::new(Erased(handler)));
        Ok(self)
    }

    pub fn build(self) -> Arc<TaskScheduler> {
        let (finished, _) = broadcast::channel(256);
        Arc::new(TaskScheduler {
            store: self.store,
            locks: self.locks,
            audit: self.audit,
            metrics: self.metrics,
            handlers: self.handlers,
            permits: Arc::new(Semaphore::new(self.workers.max(1))),
            finished,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Runs tasks on a bounded pool of workers. The task rows are the queue.
pub struct TaskScheduler {
    store: Arc<dyn Store>,
    locks: LockManager,
    audit: Arc<dyn AuditSink>,
    metrics: Metrics,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    permits: Arc<Semaphore>,
    finished: broadcast::Sender<TaskRecord>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    fn handler(&self, name: &str) -> Result<Arc<dyn ErasedHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Unsupported(format!("unknown task {}", name)))
    }

    /// Files `spec` and starts it.
    pub async fn submit(self: &Arc<Self>, spec: TaskSpec) -> Result<TaskRecord> {
        self.submit_child(spec, None).await
    }

    async fn submit_child(self: &Arc<Self>, spec: TaskSpec, parent_id: Option<String>) -> Result<TaskRecord> {
        self.handler(spec.name)?;
        let record = TaskRecord {
            base: ObjectBase::new(spec.name),
            owner_kind: spec.owner_kind.to_string(),
            owner_id: spec.owner_id,
            parent_id,
            stage: spec.stage,
            params: spec.params,
            user_cred: spec.user_cred,
            status: TaskStatus::Queued,
            status_reason: None,
            pending_children: 0,
            child_failures: vec![],
            local: false,
        };
        self.store.create(&record).await?;
        info!("queued task {}", record.ident());
        self.spawn(record.base.id.clone());
        Ok(record)
    }

    fn spawn(self: &Arc<Self>, task_id: String) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.drive(&task_id).await {
                error!("task {} stopped: {}", task_id, e);
            }
        });
    }

    /// Runs stages of `task_id` until it terminates or waits for children.
    async fn drive(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let record: TaskRecord = self.store.fetch(task_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let handler = self.handler(&record.base.name)?;
        let _owner = self
            .locks
            .lock_object(&record.owner_kind, &record.owner_id, &record.base.id)
            .await;
        let ctx = TaskContext {
            task_id: record.base.id.clone(),
            owner_id: record.owner_id.clone(),
            user_cred: record.user_cred.clone(),
            cancel: self.shutdown.child_token(),
        };
        if !record.child_failures.is_empty() {
            let reason = record.child_failures.join("; ");
            return self.fail(&handler, &ctx, &record.params, reason).await;
        }
        let mut stage = record.stage;
        let mut local = record.local;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let permit = if local {
                None
            } else {
                Some(
                    self.permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Cancelled)?,
                )
            };
            self.store
                .modify::<TaskRecord, _>(task_id, |t| {
                    t.status = TaskStatus::Running;
                    Ok(())
                })
                .await?;
            let step = handler.run(&ctx, &record.params, &stage).await;
            drop(permit);
            match step {
                Ok(Step::Complete) => {
                    return self.finish(task_id, TaskStatus::Complete, None).await;
                }
                Ok(Step::Next(next)) => {
                    self.save_stage(task_id, &next, false).await?;
                    stage = next;
                    local = false;
                }
                Ok(Step::Local(next)) => {
                    self.save_stage(task_id, &next, true).await?;
                    stage = next;
                    local = true;
                }
                Ok(Step::Wait { next, children }) if children.is_empty() => {
                    self.save_stage(task_id, &next, false).await?;
                    stage = next;
                    local = false;
                }
                Ok(Step::Wait { next, children }) => {
                    let pending = children.len() as u32;
                    self.store
                        .modify::<TaskRecord, _>(task_id, move |t| {
                            t.stage = next;
                            t.local = false;
                            t.status = TaskStatus::Waiting;
                            t.pending_children = pending;
                            t.child_failures.clear();
                            Ok(())
                        })
                        .await?;
                    debug!("task {} waits for {} children", task_id, pending);
                    for child in children {
                        if let Err(e) = self.submit_child(child, Some(task_id.to_string())).await {
                            self.child_finished(task_id, Some(e.to_string())).await?;
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    return self.fail(&handler, &ctx, &record.params, e.to_string()).await;
                }
            }
        }
    }

    async fn save_stage(&self, task_id: &str, stage: &Value, local: bool) -> Result<()> {
        let stage = stage.clone();
        self.store
            .modify::<TaskRecord, _>(task_id, move |t| {
                t.stage = stage;
                t.local = local;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn fail(
        self: &Arc<Self>,
        handler: &Arc<dyn ErasedHandler>,
        ctx: &TaskContext,
        params: &Value,
        reason: String,
    ) -> Result<()> {
        warn!("task {} failed: {}", ctx.task_id, reason);
        handler.on_failure(ctx, params, &reason).await;
        self.finish(&ctx.task_id, TaskStatus::Failed, Some(reason))
            .await
    }

    async fn finish(
        self: &Arc<Self>,
        task_id: &str,
        status: TaskStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let record = self
            .store
            .modify::<TaskRecord, _>(task_id, move |t| {
                t.status = status;
                t.status_reason = reason;
                t.local = false;
                Ok(())
            })
            .await?;
        let success = status == TaskStatus::Complete;
        info!("task {} finished as {}", record.ident(), status);
        self.metrics.task_finished(&record.base.name, success);
        self.audit.log(AuditEvent {
            action: record.base.name.clone(),
            object_kind: record.owner_kind.clone(),
            object_id: record.owner_id.clone(),
            object_name: record.owner_id.clone(),
            user: record.user_cred.clone(),
            success,
            note: record.status_reason.clone().unwrap_or_default(),
        });
        if let Some(parent_id) = &record.parent_id {
            let failure = if success {
                None
            } else {
                Some(format!(
                    "{}: {}",
                    record.base.name,
                    record.status_reason.clone().unwrap_or_default()
                ))
            };
            self.child_finished(parent_id, failure).await?;
        }
        let _ = self.finished.send(record);
        Ok(())
    }

    /// Counts a terminated child against its parent, resuming the parent
    /// after the last one.
    async fn child_finished(self: &Arc<Self>, parent_id: &str, failure: Option<String>) -> Result<()> {
        let parent = self
            .store
            .modify::<TaskRecord, _>(parent_id, move |t| {
                t.pending_children = t.pending_children.saturating_sub(1);
                t.child_failures.extend(failure);
                if t.pending_children == 0 && t.status == TaskStatus::Waiting {
                    t.status = TaskStatus::Queued;
                }
                Ok(())
            })
            .await?;
        if parent.pending_children == 0 && parent.status == TaskStatus::Queued {
            self.spawn(parent.base.id);
        }
        Ok(())
    }

    /// Waits until `task_id` terminates.
    pub async fn wait_task(&self, task_id: &str) -> Result<TaskRecord> {
        let mut finished = self.finished.subscribe();
        loop {
            let record: TaskRecord = self.store.fetch(task_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            loop {
                match finished.recv().await {
                    Ok(done) if done.base.id == task_id => return Ok(done),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::Cancelled),
                }
            }
        }
    }

    /// Restarts tasks left unfinished by a previous run. Tasks stopped in a
    /// local stage cannot be resumed and fail.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize> {
        let pending: Vec<TaskRecord> = self
            .store
            .list(&Query::new().any_of("status", [TaskStatus::Queued, TaskStatus::Running]))
            .await?;
        let mut resumed = 0;
        for record in pending {
            if record.local {
                let handler = self.handler(&record.base.name)?;
                let ctx = TaskContext {
                    task_id: record.base.id.clone(),
                    owner_id: record.owner_id.clone(),
                    user_cred: record.user_cred.clone(),
                    cancel: self.shutdown.child_token(),
                };
                self.fail(&handler, &ctx, &record.params, INTERRUPTED.to_string())
                    .await?;
            } else {
                self.spawn(record.base.id.clone());
                resumed += 1;
            }
        }
        info!("resumed {} tasks", resumed);
        Ok(resumed)
    }

    /// Whether a non-terminal task owns `owner_id`.
    pub async fn is_owner_busy(&self, owner_id: &str) -> Result<bool> {
        let tasks: Vec<TaskRecord> = self
            .store
            .list(&Query::new().eq("owner_id", owner_id).any_of(
                "status",
                [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Waiting],
            ))
            .await?;
        Ok(!tasks.is_empty())
    }

    /// Stops handing out stages. Running stages observe the cancellation.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
    }
}
