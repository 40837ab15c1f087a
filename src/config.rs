use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::control::{TAG_ARCH, TAG_CPUS, TAG_OS};

/// How the node treats an identity that is already in the workload cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Skip the download when the cached digest equals the remote object's digest.
    #[default]
    DigestMatch,
    /// Always download and verify, refreshing the cache entry.
    AlwaysFetch,
}

impl std::fmt::Display for StalenessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StalenessPolicy::DigestMatch => write!(f, "digest-match"),
            StalenessPolicy::AlwaysFetch => write!(f, "always-fetch"),
        }
    }
}

/// Configuration for the process-backed execution runtime.
///
/// Verified binaries are materialized under `work_dir/<machine id>/` and
/// spawned as child processes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding one subdirectory per running machine
    pub work_dir: PathBuf,
    /// Runtime name reported in workload summaries
    pub name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("nex-lite").join("machines"),
            name: "native".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Public identity of this node, used in control subjects
    pub node_id: String,
    /// Public encryption key advertised through info responses
    pub public_xkey: String,
    /// Durable workload cache directory
    pub cache_dir: PathBuf,
    /// Directory for per-request staging files
    pub staging_dir: PathBuf,
    /// Control-plane request timeout; bounds fetch + verify
    pub request_timeout_ms: u64,
    /// Upper bound on control messages handled in parallel
    pub max_concurrent_requests: usize,
    pub staleness: StalenessPolicy,
    pub tags: HashMap<String, String>,
    pub runtime: RuntimeConfig,
}

/// Tags every node advertises: operating system, architecture and CPU count.
pub fn default_tags() -> HashMap<String, String> {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    HashMap::from([
        (TAG_OS.to_string(), std::env::consts::OS.to_string()),
        (TAG_ARCH.to_string(), std::env::consts::ARCH.to_string()),
        (TAG_CPUS.to_string(), cpus.to_string()),
    ])
}

impl Default for NodeConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("nex-lite");
        Self {
            node_id: "local".to_string(),
            public_xkey: String::new(),
            cache_dir: base.join("cache"),
            staging_dir: base.join("staging"),
            request_timeout_ms: 30_000,
            max_concurrent_requests: 64,
            staleness: StalenessPolicy::default(),
            tags: default_tags(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Build a config whose cache, staging and machine directories all live under `root`.
    pub fn new(node_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            node_id: node_id.into(),
            cache_dir: root.join("cache"),
            staging_dir: root.join("staging"),
            runtime: RuntimeConfig {
                work_dir: root.join("machines"),
                ..RuntimeConfig::default()
            },
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn with_staleness(mut self, staleness: StalenessPolicy) -> Self {
        self.staleness = staleness;
        self
    }
}
