use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::control::WorkloadSummary;
use crate::error::{NexError, Result};

const WORKLOAD_FILE: &str = "workload";
/// Linux `ETXTBSY`: a concurrent fork still holds the freshly written binary open.
const ETXTBSY: i32 = 26;
const SPAWN_ATTEMPTS: u32 = 5;

/// Handle to a workload the runtime has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineHandle {
    pub id: String,
}

/// Execution runtime that accepts verified workload bytes.
#[async_trait]
pub trait ExecutionRuntime: Send + Sync {
    /// Runtime name reported in workload summaries.
    fn name(&self) -> &str;

    async fn dispatch(
        &self,
        identity: &str,
        bytes: Arc<[u8]>,
        workload: &WorkloadSummary,
        environment: &HashMap<String, String>,
    ) -> Result<MachineHandle>;

    async fn is_healthy(&self, machine_id: &str) -> bool;

    async fn stop(&self, machine_id: &str) -> Result<()>;
}

/// Runs each workload as a child process.
///
/// The binary is written to `work_dir/<machine id>/workload` and started with
/// an empty stdin, the request's environment and the machine directory as
/// its working directory. Children are killed when stopped or when the
/// runtime is dropped.
#[derive(Debug)]
pub struct ProcessRuntime {
    config: RuntimeConfig,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn machine_dir(&self, machine_id: &str) -> PathBuf {
        self.config.work_dir.join(machine_id)
    }

    async fn materialize(&self, machine_id: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let dir = self.machine_dir(machine_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(WORKLOAD_FILE);
        tokio::fs::write(&path, bytes).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(path)
    }

    async fn spawn(
        &self,
        machine_id: &str,
        path: &Path,
        environment: &HashMap<String, String>,
    ) -> std::io::Result<Child> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = Command::new(path)
                .envs(environment)
                .current_dir(self.machine_dir(machine_id))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            match result {
                Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl ExecutionRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn dispatch(
        &self,
        identity: &str,
        bytes: Arc<[u8]>,
        workload: &WorkloadSummary,
        environment: &HashMap<String, String>,
    ) -> Result<MachineHandle> {
        let machine_id = Uuid::new_v4().to_string();
        tracing::info!(machine_id = %machine_id, identity, name = %workload.name, "Starting workload");

        let path = self
            .materialize(&machine_id, &bytes)
            .await
            .map_err(|e| NexError::Dispatch(format!("failed to materialize workload: {}", e)))?;

        let child = match self.spawn(&machine_id, &path, environment).await {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(machine_id = %machine_id, identity, error = %e, "Workload failed to start");
                if let Err(e) = tokio::fs::remove_dir_all(self.machine_dir(&machine_id)).await {
                    tracing::warn!(machine_id = %machine_id, error = %e, "Failed to remove machine directory");
                }
                return Err(NexError::Dispatch(format!("failed to start workload: {}", e)));
            }
        };

        tracing::info!(machine_id = %machine_id, pid = ?child.id(), "Workload started");
        self.children.lock().await.insert(machine_id.clone(), child);
        Ok(MachineHandle { id: machine_id })
    }

    async fn is_healthy(&self, machine_id: &str) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(machine_id) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::info!(machine_id, status = %status, "Workload process exited");
                    false
                }
                Err(e) => {
                    tracing::warn!(machine_id, error = %e, "Failed to poll workload process");
                    false
                }
            },
            None => false,
        }
    }

    async fn stop(&self, machine_id: &str) -> Result<()> {
        let child = self.children.lock().await.remove(machine_id);
        let Some(mut child) = child else {
            return Err(NexError::NotFound(format!("machine {}", machine_id)));
        };

        // An exited child has already been reaped by `try_wait`
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(e) = child.kill().await {
                tracing::warn!(machine_id, error = %e, "Failed to kill workload process");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.machine_dir(machine_id)).await {
            tracing::warn!(machine_id, error = %e, "Failed to remove machine directory");
        }
        tracing::info!(machine_id, "Workload stopped");
        Ok(())
    }
}
