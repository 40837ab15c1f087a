use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NexError, Result};

pub const API_PREFIX: &str = "$NEX";

pub const INFO_RESPONSE_TYPE: &str = "io.nats.nex.v1.info_response";
pub const PING_RESPONSE_TYPE: &str = "io.nats.nex.v1.ping_response";
pub const RUN_RESPONSE_TYPE: &str = "io.nats.nex.v1.run_response";

pub const TAG_OS: &str = "nex.os";
pub const TAG_ARCH: &str = "nex.arch";
pub const TAG_CPUS: &str = "nex.cpucount";

/// Where a workload's bytes live in the remote object store.
///
/// `host` names the bucket and `path` the object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub host: String,
    pub path: String,
}

impl Location {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }

    /// Parse a `scheme://bucket/key` URL. The scheme is optional.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = match url.split_once("://") {
            Some((_, rest)) => rest,
            None => url,
        };
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let location = Self::new(host, format!("/{}", path));
        if location.bucket().is_empty() || location.key().is_empty() {
            return Err(NexError::InvalidRequest(format!(
                "location must name a bucket and key: {}",
                url
            )));
        }
        Ok(location)
    }

    pub fn bucket(&self) -> &str {
        self.host.trim()
    }

    /// Object key with surrounding slashes removed.
    pub fn key(&self) -> &str {
        self.path.trim_matches('/')
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket(), self.key())
    }
}

/// Signed claims attached to a workload, already decoded and verified upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedClaims {
    /// Canonical workload identity
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(rename = "iss", default)]
    pub issuer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Claim fields this node does not interpret
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_domain: Option<String>,
    pub decoded_claims: DecodedClaims,
    pub workload_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
}

impl RunRequest {
    pub fn new(location: Location, claims: DecodedClaims, workload_type: impl Into<String>) -> Self {
        Self {
            location,
            js_domain: None,
            decoded_claims: claims,
            workload_type: workload_type.into(),
            workload_name: None,
            description: None,
            environment: HashMap::new(),
        }
    }

    pub fn with_js_domain(mut self, domain: impl Into<String>) -> Self {
        self.js_domain = Some(domain.into());
        self
    }

    /// The workload identity: the subject of its signed claims.
    pub fn identity(&self) -> &str {
        self.decoded_claims.subject.trim()
    }

    /// The store namespace qualifier, if one was given and is not blank.
    pub fn js_domain(&self) -> Option<&str> {
        self.js_domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }

    /// Display name: explicit workload name, then claims name, then identity.
    pub fn display_name(&self) -> &str {
        self.workload_name
            .as_deref()
            .or(self.decoded_claims.name.as_deref())
            .unwrap_or_else(|| self.identity())
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity().is_empty() {
            return Err(NexError::InvalidRequest(
                "claims subject (workload identity) is empty".to_string(),
            ));
        }
        if self.location.bucket().is_empty() {
            return Err(NexError::InvalidRequest(
                "location host (bucket) is empty".to_string(),
            ));
        }
        if self.location.key().is_empty() {
            return Err(NexError::InvalidRequest(
                "location path (object key) is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    pub started: bool,
    pub machine_id: String,
    pub public_key: String,
    pub issuer: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub node_id: String,
    pub version: String,
    pub uptime: String,
    pub running_machines: usize,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub node_id: String,
    pub version: String,
    pub uptime: String,
    pub public_xkey: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    pub machines: Vec<MachineSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSummary {
    pub id: String,
    pub healthy: bool,
    pub uptime: String,
    pub workload: WorkloadSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub runtime: String,
    #[serde(rename = "type")]
    pub workload_type: String,
    pub hash: String,
}

/// Render a duration the way control-plane tooling prints uptimes: `1h2m3s`.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
