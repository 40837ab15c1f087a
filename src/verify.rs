//! Static-link verification gate.
//!
//! Every downloaded workload passes through [`BinaryVerifier::verify`] before
//! it can reach the cache or the runtime. A [`VerifiedWorkload`] can only be
//! produced here.

use std::path::Path;
use std::sync::Arc;

use goblin::elf::program_header::PT_INTERP;
use goblin::elf::Elf;

use crate::digest::digest_bytes;
use crate::error::{NexError, Result};
use crate::fetch::StagedPayload;

/// How an ELF binary expects to be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linkage {
    Static,
    /// Declares a `PT_INTERP` program header naming a runtime loader
    Dynamic { interpreter: String },
}

/// Inspect an ELF image. Anything that does not parse as ELF is a verification error.
pub fn classify(bytes: &[u8]) -> Result<Linkage> {
    let elf = Elf::parse(bytes)
        .map_err(|e| NexError::Verification(format!("not a parsable ELF binary: {}", e)))?;

    if elf.program_headers.iter().any(|ph| ph.p_type == PT_INTERP) {
        let interpreter = elf.interpreter.unwrap_or("<unreadable>").to_string();
        return Ok(Linkage::Dynamic { interpreter });
    }
    Ok(Linkage::Static)
}

/// Workload bytes that passed static-link verification.
#[derive(Debug, Clone)]
pub struct VerifiedWorkload {
    bytes: Arc<[u8]>,
    digest: String,
}

impl VerifiedWorkload {
    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryVerifier;

impl BinaryVerifier {
    pub fn new() -> Self {
        Self
    }

    pub async fn verify(&self, staged: &StagedPayload) -> Result<VerifiedWorkload> {
        self.verify_path(staged.path()).await
    }

    /// Read and verify a binary on disk. Parsing runs on the blocking pool.
    pub async fn verify_path(&self, path: &Path) -> Result<VerifiedWorkload> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| NexError::Verification(format!("failed to read {}: {}", path.display(), e)))?;

        let verified = tokio::task::spawn_blocking(move || Self::verify_bytes(bytes))
            .await
            .map_err(join_failure)?;

        match &verified {
            Ok(workload) => {
                tracing::info!(path = %path.display(), digest = %workload.digest, "Verified static-linked ELF binary")
            }
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Invalid ELF binary"),
        }
        verified
    }

    /// Verify an in-memory image.
    pub fn verify_bytes(bytes: Vec<u8>) -> Result<VerifiedWorkload> {
        match classify(&bytes)? {
            Linkage::Static => Ok(VerifiedWorkload {
                digest: digest_bytes(&bytes),
                bytes: Arc::from(bytes),
            }),
            Linkage::Dynamic { interpreter } => Err(NexError::Verification(format!(
                "elf binary contains at least one dynamically linked dependency (interpreter {})",
                interpreter
            ))),
        }
    }
}

/// A panic while inspecting the binary rejects it; cancellation is an internal fault.
fn join_failure(e: tokio::task::JoinError) -> NexError {
    if e.is_panic() {
        NexError::Verification(format!("binary inspection panicked: {}", e))
    } else {
        NexError::Internal(e.to_string())
    }
}
