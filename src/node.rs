use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::control::{ControlSubject, Envelope, PayloadType, RunRequest, RunResponse};
use crate::error::Result;
use crate::fetch::ObjectStore;
use crate::manager::MachineManager;
use crate::runtime::ExecutionRuntime;

/// A control message delivered by the transport.
#[derive(Debug)]
pub struct ControlMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Where the serialized reply envelope goes; `None` for fire-and-forget publishes
    pub reply: Option<oneshot::Sender<Vec<u8>>>,
}

/// A worker node: answers ping, info and run requests addressed to it.
pub struct Node {
    pub config: NodeConfig,
    pub manager: Arc<MachineManager>,
}

impl Node {
    pub async fn new(
        config: NodeConfig,
        store: Arc<dyn ObjectStore>,
        runtime: Arc<dyn ExecutionRuntime>,
    ) -> Result<Self> {
        let manager = MachineManager::start(&config, store, runtime).await?;
        tracing::info!(
            node_id = %config.node_id,
            cache_dir = %config.cache_dir.display(),
            staging_dir = %config.staging_dir.display(),
            staleness = %config.staleness,
            "Node initialized"
        );

        Ok(Self {
            config,
            manager: Arc::new(manager),
        })
    }

    /// Handle one control message and return the serialized reply.
    ///
    /// Returns `None` for subjects outside the control namespace or addressed
    /// to another node; those are not answered.
    pub async fn handle(&self, subject: &str, payload: &[u8]) -> Option<Vec<u8>> {
        let subject = match ControlSubject::parse(subject) {
            Ok(subject) => subject,
            Err(e) => {
                tracing::debug!(subject, error = %e, "Ignoring control message");
                return None;
            }
        };
        if !subject.targets(&self.config.node_id) {
            return None;
        }

        let reply = match subject {
            ControlSubject::Ping { .. } => {
                encode(&Envelope::success(PayloadType::Ping, self.manager.ping().await))
            }
            ControlSubject::Info { .. } => {
                encode(&Envelope::success(PayloadType::Info, self.manager.info().await))
            }
            ControlSubject::Run { .. } => match serde_json::from_slice::<RunRequest>(payload) {
                Ok(request) => encode(&self.manager.handle_run(request).await),
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed run request");
                    encode(&Envelope::<RunResponse>::failure(
                        PayloadType::Run,
                        format!("Invalid request: {}", e),
                    ))
                }
            },
        };
        Some(reply)
    }

    /// Serve control messages until `shutdown` fires or the channel closes.
    ///
    /// Each message runs as its own task; at most `max_concurrent_requests`
    /// are in flight. On shutdown, in-flight requests are drained and all
    /// running machines are stopped.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ControlMessage>,
        shutdown: CancellationToken,
    ) {
        let node = self;
        let permits = Arc::new(Semaphore::new(node.config.max_concurrent_requests.max(1)));
        let mut in_flight = JoinSet::new();

        tracing::info!(node_id = %node.config.node_id, "Node accepting control messages");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let node = node.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let reply = node.handle(&message.subject, &message.payload).await;
                if let (Some(reply), Some(tx)) = (reply, message.reply) {
                    if tx.send(reply).is_err() {
                        tracing::debug!(subject = %message.subject, "Requester went away before reply");
                    }
                }
            });

            // Reap finished tasks so the set does not grow without bound
            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Control message task failed");
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Draining in-flight control messages");
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Control message task failed");
            }
        }

        let stopped = node.manager.stop_all().await;
        tracing::info!(stopped, "Node stopped");
    }
}

fn encode<T: Serialize>(envelope: &Envelope<T>) -> Vec<u8> {
    match envelope.to_vec() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize reply envelope");
            let fallback = Envelope::<()>::failure(envelope.payload_type(), e.to_string());
            serde_json::to_vec(&fallback).unwrap_or_default()
        }
    }
}
