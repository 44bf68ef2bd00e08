//! Per-task runtime state and the monitor that drives it.
//!
//! A handle's state is only ever mutated by its monitor; everything else
//! reads snapshots. The state machine is monotonic: `running` (or `unknown`
//! after a transient provider error) until a terminal VM state is observed,
//! then `exited` forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc, watch};

use crate::error::{Result, VirtError};
use crate::net::TeardownSpec;
use crate::providers::{VmState, Virtualizer};

/// How often the monitor polls the provider.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Exited,
    Unknown,
}

/// Map a VM state onto the task lifecycle.
pub fn vm_state_to_task_state(state: VmState) -> TaskState {
    match state {
        VmState::Starting | VmState::Running | VmState::Paused | VmState::Suspended => {
            TaskState::Running
        }
        VmState::Shutdown | VmState::Poweroff | VmState::Error => TaskState::Exited,
        VmState::Unknown => TaskState::Unknown,
    }
}

/// Outcome delivered exactly once per task when its monitor terminates.
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub exit_code: i32,
    pub err: Option<String>,
}

impl ExitResult {
    fn clean() -> Self {
        Self {
            exit_code: 0,
            err: None,
        }
    }

    fn failed(err: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            err: Some(err.into()),
        }
    }
}

/// Exit result for a terminal VM state observation.
pub fn exit_result_for(state: VmState) -> ExitResult {
    match state {
        VmState::Shutdown | VmState::Poweroff => ExitResult::clean(),
        VmState::Error => ExitResult::failed(VirtError::TaskCrashed.to_string()),
        other => ExitResult::failed(format!("vm entered unexpected state {other}")),
    }
}

/// Snapshot of a task handle.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task_id: String,
    pub vm_name: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_result: Option<ExitResult>,
}

/// Memory and CPU usage read straight from the provider.
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub max_memory_bytes: u64,
    pub cpu_time_ns: u64,
}

struct HandleState {
    state: TaskState,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
    waiters: Vec<mpsc::Sender<ExitResult>>,
}

pub struct TaskHandle {
    pub task_id: String,
    pub vm_name: String,
    pub started_at: DateTime<Utc>,
    /// Host-side network changes to reverse when the VM is gone. Consumed
    /// exactly once.
    teardown: Mutex<Option<TeardownSpec>>,
    inner: RwLock<HandleState>,
}

impl TaskHandle {
    pub fn new(task_id: String, vm_name: String, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            vm_name,
            started_at,
            teardown: Mutex::new(None),
            inner: RwLock::new(HandleState {
                state: TaskState::Running,
                completed_at: None,
                exit_result: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Reconstruct a handle for a task recovered after a driver restart.
    pub fn recovered(
        task_id: String,
        vm_name: String,
        started_at: DateTime<Utc>,
        vm_state: VmState,
    ) -> Self {
        let handle = Self::new(task_id, vm_name, started_at);
        let state = vm_state_to_task_state(vm_state);
        {
            // No monitor is running yet, so this is still single-owner.
            let inner = handle.inner.try_write();
            if let Ok(mut inner) = inner {
                inner.state = state;
                if state == TaskState::Exited {
                    inner.completed_at = Some(Utc::now());
                    inner.exit_result = Some(exit_result_for(vm_state));
                }
            }
        }
        handle
    }

    pub async fn set_teardown(&self, spec: TeardownSpec) {
        *self.teardown.lock().await = Some(spec);
    }

    /// Take the teardown spec; later calls see nothing.
    pub async fn take_teardown(&self) -> Option<TeardownSpec> {
        self.teardown.lock().await.take()
    }

    pub async fn status(&self) -> TaskStatus {
        let inner = self.inner.read().await;
        TaskStatus {
            task_id: self.task_id.clone(),
            vm_name: self.vm_name.clone(),
            state: inner.state,
            started_at: self.started_at,
            completed_at: inner.completed_at,
            exit_result: inner.exit_result.clone(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.state == TaskState::Running
    }

    pub async fn is_exited(&self) -> bool {
        self.inner.read().await.state == TaskState::Exited
    }

    /// Channel delivering this task's single exit result. Already-exited
    /// tasks get it immediately.
    pub async fn wait(&self) -> mpsc::Receiver<ExitResult> {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.write().await;
        if let Some(result) = &inner.exit_result {
            let _ = tx.try_send(result.clone());
        } else {
            inner.waiters.push(tx);
        }
        rx
    }

    /// Current memory and CPU accounting from the provider.
    pub async fn stats(&self, provider: &dyn Virtualizer) -> Result<ResourceUsage> {
        match provider.get_vm(&self.vm_name).await {
            Ok(info) => Ok(ResourceUsage {
                memory_bytes: info.memory_kb * 1024,
                max_memory_bytes: info.max_memory_kb * 1024,
                cpu_time_ns: info.cpu_time_ns,
            }),
            Err(e) if e.is_not_found() => Err(VirtError::TaskNotFound(self.task_id.clone())),
            Err(e) => Err(e),
        }
    }

    async fn transition(&self, state: TaskState) {
        let mut inner = self.inner.write().await;
        if inner.state != state && inner.state != TaskState::Exited {
            tracing::debug!(
                "Task {} moving from {:?} to {state:?}",
                self.task_id,
                inner.state
            );
            inner.state = state;
        }
    }

    async fn finish(&self, result: ExitResult) {
        let mut inner = self.inner.write().await;
        if inner.state == TaskState::Exited {
            return;
        }
        inner.state = TaskState::Exited;
        inner.completed_at = Some(Utc::now());
        inner.exit_result = Some(result.clone());
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.try_send(result.clone());
        }
    }

    /// Poll the VM until it reaches a terminal state or disappears, then
    /// record the exit result and deliver it on `exit_tx`.
    ///
    /// Transient provider errors park the task in `unknown`; it returns to
    /// `running` as soon as the provider answers again. Cancelling the driver
    /// context stops the monitor without a state change.
    pub async fn monitor(
        self: &Arc<Self>,
        provider: &dyn Virtualizer,
        exit_tx: mpsc::Sender<ExitResult>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.monitor_with_interval(provider, exit_tx, &mut shutdown, MONITOR_INTERVAL)
            .await;
    }

    async fn monitor_with_interval(
        self: &Arc<Self>,
        provider: &dyn Virtualizer,
        exit_tx: mpsc::Sender<ExitResult>,
        shutdown: &mut watch::Receiver<bool>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::debug!("Monitor for task {} cancelled", self.task_id);
                    return;
                }
            }

            match provider.get_vm(&self.vm_name).await {
                Ok(info) => match vm_state_to_task_state(info.state) {
                    TaskState::Running => self.transition(TaskState::Running).await,
                    TaskState::Unknown => self.transition(TaskState::Unknown).await,
                    TaskState::Exited => {
                        let result = exit_result_for(info.state);
                        tracing::info!(
                            "Task {} exited: vm {} reported {}",
                            self.task_id,
                            self.vm_name,
                            info.state
                        );
                        self.finish(result.clone()).await;
                        let _ = exit_tx.send(result).await;
                        return;
                    }
                },
                Err(e) if e.is_not_found() => {
                    let result = ExitResult::failed(
                        VirtError::TaskNotFound(self.task_id.clone()).to_string(),
                    );
                    tracing::info!(
                        "Task {} exited: vm {} is gone",
                        self.task_id,
                        self.vm_name
                    );
                    self.finish(result.clone()).await;
                    let _ = exit_tx.send(result).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Transient provider error while monitoring {}: {e}",
                        self.task_id
                    );
                    self.transition(TaskState::Unknown).await;
                }
            }
        }
    }
}
