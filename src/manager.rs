//! Machine manager: drives one run request through the acquisition pipeline.
//!
//! # Pipeline
//!
//! `Received → Fetching → Verifying → Caching → Dispatched`
//!
//! 1. **Received**: the request is validated and its identity extracted
//! 2. **Fetching**: the object is resolved in the remote store; when the
//!    staleness policy allows and the cached digest matches the remote one,
//!    the cached bytes are dispatched without downloading again
//! 3. **Verifying**: the staged binary must be statically linked
//! 4. **Caching**: verified bytes are written under the workload identity
//! 5. **Dispatched**: the runtime starts the workload and returns a machine id
//!
//! Any failure is terminal for the request and is reported as a
//! [`RunFailure`] naming the stage it happened in. Fetching and verifying
//! together run under the configured request deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::cache::WorkloadCache;
use crate::config::{NodeConfig, StalenessPolicy};
use crate::control::{
    format_uptime, Envelope, InfoResponse, MachineSummary, PayloadType, PingResponse, RunRequest,
    RunResponse, WorkloadSummary,
};
use crate::error::{NexError, Result};
use crate::fetch::{ObjectStore, PayloadFetcher};
use crate::runtime::ExecutionRuntime;
use crate::verify::{BinaryVerifier, VerifiedWorkload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Fetching,
    Verifying,
    Caching,
    Dispatched,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Received => write!(f, "received"),
            PipelineStage::Fetching => write!(f, "fetching"),
            PipelineStage::Verifying => write!(f, "verifying"),
            PipelineStage::Caching => write!(f, "caching"),
            PipelineStage::Dispatched => write!(f, "dispatched"),
        }
    }
}

/// Terminal failure of a run request.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct RunFailure {
    pub stage: PipelineStage,
    pub source: NexError,
}

impl RunFailure {
    fn at(stage: PipelineStage) -> impl FnOnce(NexError) -> RunFailure {
        move |source| RunFailure { stage, source }
    }
}

/// Workload bytes ready for caching and dispatch.
struct Acquired {
    bytes: Arc<[u8]>,
    digest: String,
    /// Verified in this request and not yet written to the cache
    needs_caching: Option<VerifiedWorkload>,
}

#[derive(Debug, Clone)]
struct RunningMachine {
    id: String,
    identity: String,
    started_at: Instant,
    workload: WorkloadSummary,
}

pub struct MachineManager {
    node_id: String,
    public_xkey: String,
    tags: HashMap<String, String>,
    started_at: Instant,
    request_timeout: Duration,
    staleness: StalenessPolicy,
    store: Arc<dyn ObjectStore>,
    fetcher: PayloadFetcher,
    verifier: BinaryVerifier,
    cache: Arc<WorkloadCache>,
    runtime: Arc<dyn ExecutionRuntime>,
    machines: RwLock<Vec<RunningMachine>>,
}

impl MachineManager {
    pub fn new(
        config: &NodeConfig,
        store: Arc<dyn ObjectStore>,
        cache: Arc<WorkloadCache>,
        runtime: Arc<dyn ExecutionRuntime>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            public_xkey: config.public_xkey.clone(),
            tags: config.tags.clone(),
            started_at: Instant::now(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            staleness: config.staleness,
            store,
            fetcher: PayloadFetcher::new(&config.staging_dir),
            verifier: BinaryVerifier::new(),
            cache,
            runtime,
            machines: RwLock::new(Vec::new()),
        }
    }

    /// Open the cache and staging area described by `config` and build a manager over them.
    pub async fn start(
        config: &NodeConfig,
        store: Arc<dyn ObjectStore>,
        runtime: Arc<dyn ExecutionRuntime>,
    ) -> Result<Self> {
        let cache = Arc::new(WorkloadCache::open(&config.cache_dir).await?);
        let manager = Self::new(config, store, cache, runtime);
        manager.fetcher.prepare().await?;
        Ok(manager)
    }

    pub fn cache(&self) -> &Arc<WorkloadCache> {
        &self.cache
    }

    /// Run a request and wrap the outcome in a reply envelope.
    pub async fn handle_run(&self, request: RunRequest) -> Envelope<RunResponse> {
        match self.run_workload(request).await {
            Ok(response) => Envelope::success(PayloadType::Run, response),
            Err(failure) => Envelope::failure(PayloadType::Run, failure.source.to_string()),
        }
    }

    pub async fn run_workload(&self, request: RunRequest) -> std::result::Result<RunResponse, RunFailure> {
        request.validate().map_err(RunFailure::at(PipelineStage::Received))?;
        let identity = request.identity().to_string();
        tracing::info!(identity = %identity, location = %request.location, "Received run request");

        let mut stage = PipelineStage::Received;
        let acquired = tokio::time::timeout(self.request_timeout, self.acquire(&request, &mut stage)).await;
        let acquired = match acquired {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.request_timeout.as_millis() as u64;
                tracing::warn!(identity = %identity, stage = %stage, timeout_ms, "Run request timed out");
                Err(RunFailure {
                    stage,
                    source: NexError::Timeout(timeout_ms),
                })
            }
        };
        let acquired = acquired.inspect_err(|failure| {
            tracing::error!(identity = %identity, stage = %failure.stage, error = %failure.source, "Run request failed");
        })?;

        if let Some(verified) = &acquired.needs_caching {
            self.cache
                .put(&identity, verified)
                .await
                .map_err(RunFailure::at(PipelineStage::Caching))
                .inspect_err(|failure| {
                    tracing::error!(identity = %identity, error = %failure.source, "Run request failed");
                })?;
        }

        let workload = WorkloadSummary {
            name: request.display_name().to_string(),
            description: request.description.clone().unwrap_or_default(),
            runtime: self.runtime.name().to_string(),
            workload_type: request.workload_type.clone(),
            hash: acquired.digest.clone(),
        };
        let handle = self
            .runtime
            .dispatch(&identity, acquired.bytes.clone(), &workload, &request.environment)
            .await
            .map_err(RunFailure::at(PipelineStage::Dispatched))
            .inspect_err(|failure| {
                tracing::error!(identity = %identity, error = %failure.source, "Run request failed");
            })?;

        self.machines.write().await.push(RunningMachine {
            id: handle.id.clone(),
            identity: identity.clone(),
            started_at: Instant::now(),
            workload,
        });
        tracing::info!(identity = %identity, machine_id = %handle.id, "Workload dispatched");

        Ok(RunResponse {
            started: true,
            machine_id: handle.id,
            public_key: identity,
            issuer: request.decoded_claims.issuer.clone(),
            hash: acquired.digest,
        })
    }

    /// Fetch and verify, or reuse a cache entry whose digest still matches the remote object.
    async fn acquire(
        &self,
        request: &RunRequest,
        stage: &mut PipelineStage,
    ) -> std::result::Result<Acquired, RunFailure> {
        let identity = request.identity();

        *stage = PipelineStage::Fetching;
        let resolved = self
            .fetcher
            .resolve(self.store.as_ref(), &request.location, request.js_domain())
            .await
            .map_err(RunFailure::at(PipelineStage::Fetching))?;

        if self.staleness == StalenessPolicy::DigestMatch && !resolved.info.digest.is_empty() {
            match self.cache.get(identity).await {
                Ok(hit) if hit.digest() == resolved.info.digest => {
                    tracing::info!(identity, digest = %hit.digest(), "Using cached workload");
                    return Ok(Acquired {
                        bytes: hit.bytes().clone(),
                        digest: hit.meta.digest,
                        needs_caching: None,
                    });
                }
                Ok(hit) => {
                    tracing::debug!(identity, cached = %hit.digest(), remote = %resolved.info.digest, "Cached workload is stale");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(identity, error = %e, "Cache lookup failed, fetching"),
            }
        }

        let staged = self
            .fetcher
            .download(resolved)
            .await
            .map_err(RunFailure::at(PipelineStage::Fetching))?;

        *stage = PipelineStage::Verifying;
        let verified = self
            .verifier
            .verify(&staged)
            .await
            .map_err(RunFailure::at(PipelineStage::Verifying))?;
        drop(staged);

        *stage = PipelineStage::Caching;
        Ok(Acquired {
            bytes: verified.bytes().clone(),
            digest: verified.digest().to_string(),
            needs_caching: Some(verified),
        })
    }

    /// Number of machines whose workload is still running.
    pub async fn running_machines(&self) -> usize {
        self.reap_exited().await;
        self.machines.read().await.len()
    }

    /// Remove machines the runtime no longer reports as running and release them.
    async fn reap_exited(&self) -> usize {
        let machines = self.machines.read().await.clone();
        let mut exited = Vec::new();
        for machine in machines {
            if !self.runtime.is_healthy(&machine.id).await {
                exited.push(machine);
            }
        }
        if exited.is_empty() {
            return 0;
        }

        self.machines
            .write()
            .await
            .retain(|m| !exited.iter().any(|e| e.id == m.id));
        for machine in &exited {
            tracing::info!(machine_id = %machine.id, identity = %machine.identity, "Workload exited, removing machine");
            if let Err(e) = self.runtime.stop(&machine.id).await {
                tracing::warn!(machine_id = %machine.id, error = %e, "Failed to release exited machine");
            }
        }
        exited.len()
    }

    pub async fn ping(&self) -> PingResponse {
        PingResponse {
            node_id: self.node_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: format_uptime(self.started_at.elapsed()),
            running_machines: self.running_machines().await,
            tags: self.tags.clone(),
        }
    }

    pub async fn info(&self) -> InfoResponse {
        self.reap_exited().await;
        let machines = self.machines.read().await.clone();

        let mut summaries = Vec::with_capacity(machines.len());
        for machine in machines {
            summaries.push(MachineSummary {
                healthy: self.runtime.is_healthy(&machine.id).await,
                uptime: format_uptime(machine.started_at.elapsed()),
                id: machine.id,
                workload: machine.workload,
            });
        }

        InfoResponse {
            node_id: self.node_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: format_uptime(self.started_at.elapsed()),
            public_xkey: self.public_xkey.clone(),
            tags: self.tags.clone(),
            machines: summaries,
        }
    }

    pub async fn stop_machine(&self, machine_id: &str) -> Result<()> {
        let removed = {
            let mut machines = self.machines.write().await;
            let before = machines.len();
            machines.retain(|m| m.id != machine_id);
            before != machines.len()
        };
        if !removed {
            return Err(NexError::NotFound(format!("machine {}", machine_id)));
        }
        self.runtime.stop(machine_id).await
    }

    /// Stop every running machine. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let machines: Vec<RunningMachine> = std::mem::take(&mut *self.machines.write().await);
        let mut stopped = 0;
        for machine in machines {
            match self.runtime.stop(&machine.id).await {
                Ok(()) => stopped += 1,
                Err(e) => tracing::warn!(machine_id = %machine.id, error = %e, "Failed to stop machine"),
            }
        }
        stopped
    }
}
