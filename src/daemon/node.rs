//! Process assembly: the threads and channels each server role runs.
//!
//! An active owns the lane pool, the transaction ingress and (when
//! replication is enabled) the replication sender thread. A passive owns the
//! receiver thread fed by a bounded envelope channel.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Sender;

use super::collab::{ClientChannels, EntityRegistry, ReplicationTransport, TransactionOrderStore};
use super::ingress::{IngressParts, TransactionIngress};
use super::lanes::LanePool;
use super::repl::proto::{AckBatch, ReplEnvelope};
use super::repl::receiver::{ReceiverRuntime, ReplicationReceiver};
use super::repl::sender::{SenderHandle, SenderRuntime};
use super::repl::{PassiveProgress, ReplError};
use super::sync_driver::{SyncDriver, SyncSummary};
use crate::config::{Config, ConfigError, ServerRole};
use crate::core::NodeId;
use crate::error::Error;

pub struct ActiveParts {
    pub local: NodeId,
    pub registry: Arc<dyn EntityRegistry>,
    pub store: Arc<dyn TransactionOrderStore>,
    pub clients: Arc<dyn ClientChannels>,
    pub transport: Arc<dyn ReplicationTransport>,
}

struct SenderThread {
    handle: SenderHandle,
    join: JoinHandle<()>,
}

pub struct ActiveServer {
    local: NodeId,
    registry: Arc<dyn EntityRegistry>,
    ingress: TransactionIngress,
    pool: LanePool,
    sender: Option<SenderThread>,
}

fn require_role(config: &Config, requested: ServerRole) -> Result<(), ConfigError> {
    if config.replication.role != requested {
        return Err(ConfigError::Role {
            configured: config.replication.role,
            requested,
        });
    }
    Ok(())
}

impl ActiveServer {
    /// Starts the active pipeline and reloads persisted entities.
    pub fn start(config: &Config, parts: ActiveParts) -> Result<Self, Error> {
        require_role(config, ServerRole::Active)?;
        let limits = &config.limits;
        let pool = LanePool::start(config.lanes.workers, limits.max_lane_queue_depth)?;
        let sender = if config.replication.enabled {
            let (handle, join) =
                SenderRuntime::new(parts.local, parts.transport, limits).spawn(limits)?;
            Some(SenderThread { handle, join })
        } else {
            None
        };
        let ingress = TransactionIngress::new(IngressParts {
            local: parts.local,
            registry: Arc::clone(&parts.registry),
            store: parts.store,
            clients: parts.clients,
            lanes: pool.scheduler(),
            replication: sender.as_ref().map(|thread| thread.handle.clone()),
            limits: limits.clone(),
        });
        let loaded = ingress.load_existing_entities()?;
        tracing::info!(
            node = %parts.local,
            workers = config.lanes.workers,
            replication = config.replication.enabled,
            loaded,
            "active server started"
        );
        Ok(Self {
            local: parts.local,
            registry: parts.registry,
            ingress,
            pool,
            sender,
        })
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn ingress(&self) -> &TransactionIngress {
        &self.ingress
    }

    fn replication(&self) -> Result<&SenderHandle, Error> {
        self.sender
            .as_ref()
            .map(|thread| &thread.handle)
            .ok_or_else(|| Error::from(ReplError::Closed))
    }

    /// Attaches `passive` and streams it a full sync.
    pub fn sync_passive(&self, passive: NodeId) -> Result<SyncSummary, Error> {
        let sender = self.replication()?.clone();
        SyncDriver::new(Arc::clone(&self.registry), self.pool.scheduler(), sender).run(passive)
    }

    pub fn remove_passive(&self, passive: NodeId) -> Result<(), Error> {
        self.replication()?.remove_passive(passive)?;
        Ok(())
    }

    pub fn deliver_acks(&self, batch: AckBatch) -> Result<(), Error> {
        self.replication()?.deliver_acks(batch)?;
        Ok(())
    }

    pub fn passive_progress(&self, passive: NodeId) -> Result<Option<PassiveProgress>, Error> {
        Ok(self.replication()?.progress(passive)?)
    }

    pub fn replication_handle(&self) -> Option<SenderHandle> {
        self.sender.as_ref().map(|thread| thread.handle.clone())
    }

    /// Stops the lanes first so every op that applied has reached the sender
    /// before it stops. Queued ops are cancelled.
    pub fn shutdown(self) {
        self.pool.shutdown();
        if let Some(thread) = self.sender {
            thread.handle.shutdown();
            if thread.join.join().is_err() {
                tracing::error!("replication sender thread panicked");
            }
        }
        tracing::info!(node = %self.local, "active server stopped");
    }
}

pub struct PassiveServer {
    local: NodeId,
    inbound: Sender<ReplEnvelope>,
    join: JoinHandle<Result<(), ReplError>>,
}

impl PassiveServer {
    pub fn start(
        config: &Config,
        local: NodeId,
        registry: Arc<dyn EntityRegistry>,
        store: Arc<dyn TransactionOrderStore>,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Result<Self, Error> {
        require_role(config, ServerRole::Passive)?;
        let limits = &config.limits;
        let (inbound, rx) = crossbeam::channel::bounded(limits.repl_channel_capacity);
        let receiver = ReplicationReceiver::new(registry, store, limits.clone());
        let join = ReceiverRuntime::new(local, receiver, transport, limits).spawn(rx)?;
        tracing::info!(node = %local, "passive server started");
        Ok(Self {
            local,
            inbound,
            join,
        })
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Where decoded envelopes from the active go.
    pub fn inbound(&self) -> &Sender<ReplEnvelope> {
        &self.inbound
    }

    /// Waits for queued envelopes to be applied. Returns the session error
    /// if the receiver aborted.
    pub fn shutdown(self) -> Result<(), Error> {
        drop(self.inbound);
        let outcome = match self.join.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(ReplError::Closed),
        };
        tracing::info!(node = %self.local, "passive server stopped");
        Ok(outcome?)
    }
}
