//! Transaction ingress on the active.
//!
//! A client request is acknowledged RECEIVED as soon as it is accepted, then
//! runs on its (entity, key) lane: apply, replicate, complete. Completion
//! hands the token to the entity's retirement manager, and every request that
//! comes back retireable is answered with APPLIED (result or error) followed
//! by RETIRED. Replication never gates retirement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;

use super::collab::{
    ApplyOutcome, ClientChannels, EntityRegistry, FollowUp, TransactionOrderStore,
};
use super::lanes::{JobClass, LaneJob, LaneScheduler};
use super::metrics;
use super::partition;
use super::repl::activity::{ActivityKind, ClientOrigin, SyncReplicationActivity};
use super::repl::peer_acks::{DeliveryCallback, DeliveryOutcome};
use super::repl::proto::{ClientRequest, ServerAck};
use super::repl::sender::SenderHandle;
use super::retirement::{RetirementError, RetirementManager};
use crate::core::{
    ClientId, CompletionToken, EntityDescriptor, EntityError, EntityId,
    EntityVersion, Limits, NodeId, RequestOrigin, ServerEntityAction, ServerEntityRequest,
    TokenSource, TransactionId,
};
use crate::error::Error;

/// How a resent request was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResendOutcome {
    /// Below the client's own watermark; the client already saw it retire.
    Dropped,
    /// Answered from the journal without re-applying.
    Answered,
    /// Never applied here; submitted again.
    Resubmitted,
}

pub struct IngressParts {
    pub local: NodeId,
    pub registry: Arc<dyn EntityRegistry>,
    pub store: Arc<dyn TransactionOrderStore>,
    pub clients: Arc<dyn ClientChannels>,
    pub lanes: LaneScheduler,
    pub replication: Option<SenderHandle>,
    pub limits: Limits,
}

/// Cloneable; every clone drives the same pipeline.
#[derive(Clone)]
pub struct TransactionIngress {
    shared: Arc<Shared>,
}

struct Shared {
    local: NodeId,
    registry: Arc<dyn EntityRegistry>,
    store: Arc<dyn TransactionOrderStore>,
    clients: Arc<dyn ClientChannels>,
    lanes: LaneScheduler,
    replication: Option<SenderHandle>,
    limits: Limits,
    tokens: TokenSource,
    retirement: Mutex<HashMap<EntityId, Arc<RetirementManager>>>,
    results: Mutex<HashMap<(ClientId, TransactionId), Result<Bytes, EntityError>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransactionIngress {
    pub fn new(parts: IngressParts) -> Self {
        Self {
            shared: Arc::new(Shared {
                local: parts.local,
                registry: parts.registry,
                store: parts.store,
                clients: parts.clients,
                lanes: parts.lanes,
                replication: parts.replication,
                limits: parts.limits,
                tokens: TokenSource::new(),
                retirement: Mutex::new(HashMap::new()),
                results: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Accepts a client request.
    ///
    /// Every outcome is acknowledged to the client; the returned error is for
    /// the caller's logging only.
    pub fn submit(&self, client: ClientId, request: ClientRequest) -> Result<(), EntityError> {
        let transaction = request.transaction;
        if let Err(err) = self.shared.validate(&request) {
            tracing::debug!(client = %client, tx = %transaction, "rejected request: {err}");
            self.shared.reply(client, ServerAck::applied(transaction, &Err(err.clone())));
            self.shared.reply(client, ServerAck::retired(transaction));
            return Err(err);
        }
        let entity = request.descriptor.entity.clone();
        let key = match partition::key_for(
            self.shared.registry.as_ref(),
            &entity,
            request.action,
            &request.payload,
            None,
        ) {
            Ok(key) => key,
            Err(err) => {
                self.shared.reply(client, ServerAck::applied(transaction, &Err(err.clone())));
                self.shared.reply(client, ServerAck::retired(transaction));
                return Err(err);
            }
        };

        self.shared.reply(client, ServerAck::received(transaction));
        if let Err(err) = self.shared.store.record_applied_order(
            client,
            transaction,
            request.oldest_outstanding,
        ) {
            tracing::warn!(client = %client, tx = %transaction, "failed to record order: {err}");
        }

        let server_request = ServerEntityRequest {
            descriptor: request.descriptor,
            action: request.action,
            key,
            payload: request.payload,
            source: self.shared.local,
            origin: RequestOrigin::Client {
                client,
                transaction,
                oldest_outstanding: request.oldest_outstanding,
            },
        };
        let token = self.shared.tokens.next_token();
        self.shared.dispatch(server_request, token)
    }

    /// Answers a request the client sent again after reconnecting.
    pub fn handle_resend(
        &self,
        client: ClientId,
        request: ClientRequest,
    ) -> Result<ResendOutcome, Error> {
        let transaction = request.transaction;
        if let Some(watermark) = self.shared.store.oldest_outstanding(client)?
            && transaction < watermark
        {
            tracing::debug!(client = %client, tx = %transaction, %watermark, "dropping resend below watermark");
            return Ok(ResendOutcome::Dropped);
        }
        if let Some(result) = self.shared.store.journaled_result(client, transaction)? {
            self.shared.reply(client, ServerAck::received(transaction));
            self.shared.reply(client, ServerAck::applied(transaction, &result));
            self.shared.reply(client, ServerAck::retired(transaction));
            return Ok(ResendOutcome::Answered);
        }
        // Rejections are already acked to the client.
        let _ = self.submit(client, request);
        Ok(ResendOutcome::Resubmitted)
    }

    /// Forgets a client's pending retirements. Work already dispatched still
    /// runs, replicates and is journaled; it just is not acknowledged.
    pub fn client_disconnected(&self, client: ClientId) -> Result<usize, Error> {
        // Held across the purge so a completing request cannot park a result
        // for a waiter that is about to vanish.
        let mut results = lock(&self.shared.results);
        let managers: Vec<Arc<RetirementManager>> =
            lock(&self.shared.retirement).values().cloned().collect();
        let mut purged = 0;
        for manager in managers {
            purged += manager.purge_client(client)?.len();
        }
        results.retain(|(owner, _), _| *owner != client);
        drop(results);
        tracing::info!(client = %client, purged, "client disconnected");
        Ok(purged)
    }

    /// Drops the journal of a client that will not reconnect.
    pub fn forget_client(&self, client: ClientId) -> Result<(), Error> {
        self.client_disconnected(client)?;
        self.shared.store.forget_client(client)?;
        Ok(())
    }

    /// Recreates persisted entities in creation order. Returns how many.
    pub fn load_existing_entities(&self) -> Result<usize, Error> {
        let mut persisted = self.shared.store.load_existing_entities()?;
        persisted.sort_by_key(|entry| entry.creation_order);
        for entry in &persisted {
            self.shared
                .registry
                .create_entity(&entry.entity, Some(entry.version), &entry.config)?;
            tracing::debug!(entity = %entry.entity, version = %entry.version, "loaded entity");
        }
        Ok(persisted.len())
    }

    /// Tokens of `entity` not yet retired.
    pub fn pending_retirements(&self, entity: &EntityId) -> usize {
        lock(&self.shared.retirement)
            .get(entity)
            .map_or(0, |manager| manager.pending())
    }
}

impl Shared {
    fn validate(&self, request: &ClientRequest) -> Result<(), EntityError> {
        if !request.action.is_client_action() {
            return Err(EntityError::Refused {
                reason: format!("{} is not a client action", request.action),
            });
        }
        if request.payload.len() > self.limits.max_payload_bytes {
            return Err(EntityError::Refused {
                reason: format!(
                    "payload of {} bytes exceeds {}",
                    request.payload.len(),
                    self.limits.max_payload_bytes
                ),
            });
        }
        let entity = &request.descriptor.entity;
        match (request.action, self.registry.get_entity(entity)) {
            (ServerEntityAction::Create, Some(info)) => Err(EntityError::AlreadyExists {
                entity: entity.clone(),
                version: info.version,
            }),
            (ServerEntityAction::Create, None) => Ok(()),
            (_, None) => Err(EntityError::NotFound {
                entity: entity.clone(),
            }),
            (_, Some(info)) if info.version != request.descriptor.version => {
                Err(EntityError::VersionMismatch {
                    entity: entity.clone(),
                    expected: request.descriptor.version,
                    found: info.version,
                })
            }
            _ => Ok(()),
        }
    }

    fn retirement_for(&self, entity: &EntityId) -> Arc<RetirementManager> {
        Arc::clone(
            lock(&self.retirement)
                .entry(entity.clone())
                .or_insert_with(|| Arc::new(RetirementManager::new())),
        )
    }

    /// Registers under the map lock so a prune cannot drop the manager
    /// between lookup and registration.
    fn register(
        &self,
        request: ServerEntityRequest,
        token: CompletionToken,
    ) -> Result<Arc<RetirementManager>, RetirementError> {
        let mut managers = lock(&self.retirement);
        let manager = managers
            .entry(request.descriptor.entity.clone())
            .or_insert_with(|| Arc::new(RetirementManager::new()));
        let key = request.key;
        manager.register_with_message(request, token, key)?;
        Ok(Arc::clone(manager))
    }

    /// Drops the manager of an entity that no longer exists once it is idle.
    fn prune_retirement(&self, entity: &EntityId) {
        if self.registry.get_entity(entity).is_some() {
            return;
        }
        let mut managers = lock(&self.retirement);
        if managers
            .get(entity)
            .is_some_and(|manager| manager.pending() == 0)
        {
            managers.remove(entity);
            tracing::trace!(entity = %entity, "retirement manager pruned");
        }
    }

    fn reply(&self, client: ClientId, ack: ServerAck) {
        if let Err(err) = self.clients.send(client, ack) {
            tracing::debug!(client = %client, "dropping ack: {err}");
        }
    }

    /// Registers `request` under `token` and queues it on its lane.
    fn dispatch(
        self: &Arc<Self>,
        request: ServerEntityRequest,
        token: CompletionToken,
    ) -> Result<(), EntityError> {
        let entity = request.descriptor.entity.clone();
        let key = request.key;
        let manager = match self.register(request.clone(), token) {
            Ok(manager) => manager,
            Err(err) => {
                tracing::error!(entity = %entity, token = %token, "retirement registration failed: {err}");
                return Err(EntityError::Refused {
                    reason: err.to_string(),
                });
            }
        };
        metrics::set_retirement_pending(manager.pending());

        let class = if request.action == ServerEntityAction::Create {
            JobClass::Create
        } else {
            JobClass::Regular
        };
        let runner = Arc::clone(self);
        let canceller = Arc::clone(self);
        let cancelled = request.clone();
        let rejected = request.clone();
        let job = LaneJob::new(
            entity.clone(),
            key,
            class,
            move || runner.execute(request, token),
            move |err| canceller.complete(&cancelled, token, Err(err)),
        );
        if let Err(err) = self.lanes.submit(job) {
            tracing::warn!(entity = %entity, key = %key, "lane rejected request: {err}");
            // The job was dropped unrun; retire it with the rejection.
            self.complete(&rejected, token, Err(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Runs on the request's lane.
    fn execute(self: &Arc<Self>, request: ServerEntityRequest, token: CompletionToken) {
        let started = Instant::now();
        let entity = request.descriptor.entity.clone();
        let outcome = self.apply(&request);
        match &outcome {
            Ok((_, version)) => {
                metrics::apply_ok(request.action.as_str(), started.elapsed());
                self.replicate(&request, *version);
            }
            Err(err) => {
                metrics::apply_err(request.action.as_str(), started.elapsed());
                tracing::debug!(entity = %entity, action = %request.action, "apply failed: {err}");
            }
        }

        let result = match outcome {
            Ok((applied, version)) => {
                self.after_apply(&request, version);
                for follow_up in applied.follow_ups {
                    self.dispatch_follow_up(&request, version, token, follow_up);
                }
                Ok(applied.result)
            }
            Err(err) => Err(err),
        };
        self.complete(&request, token, result);
    }

    /// Applies locally. Returns the outcome and the incarnation it ran against.
    fn apply(
        &self,
        request: &ServerEntityRequest,
    ) -> Result<(ApplyOutcome, EntityVersion), EntityError> {
        let entity = &request.descriptor.entity;
        match request.action {
            ServerEntityAction::Create => {
                let version = self.registry.create_entity(entity, None, &request.payload)?;
                let result = Bytes::copy_from_slice(&version.get().to_be_bytes());
                Ok((ApplyOutcome::new(result), version))
            }
            action => {
                let outcome =
                    self.registry
                        .apply_action(&request.descriptor, action, request.key, &request.payload)?;
                Ok((outcome, request.descriptor.version))
            }
        }
    }

    fn after_apply(&self, request: &ServerEntityRequest, version: EntityVersion) {
        let entity = &request.descriptor.entity;
        let persisted = match request.action {
            ServerEntityAction::Create => {
                self.store
                    .record_entity_created(entity, version, &request.payload)
            }
            ServerEntityAction::Destroy => {
                self.lanes.cancel_pending(entity);
                self.store.record_entity_destroyed(entity)
            }
            _ => Ok(()),
        };
        if let Err(err) = persisted {
            tracing::warn!(entity = %entity, action = %request.action, "failed to persist lifecycle change: {err}");
        }
    }

    fn replicate(&self, request: &ServerEntityRequest, version: EntityVersion) {
        let Some(replication) = &self.replication else {
            return;
        };
        let Some(kind) = ActivityKind::from_live_action(request.action) else {
            return;
        };
        let origin = match &request.origin {
            RequestOrigin::Client {
                client,
                transaction,
                oldest_outstanding,
            } => Some(ClientOrigin {
                client: *client,
                transaction: *transaction,
                oldest_outstanding: *oldest_outstanding,
            }),
            RequestOrigin::Replicated { .. } | RequestOrigin::Internal => None,
        };
        let callback = origin.as_ref().map(|origin| self.replicated_callback(origin));
        let activity = SyncReplicationActivity::live(
            kind,
            request.descriptor.entity.clone(),
            version,
            request.key,
            request.payload.clone(),
            origin,
        );
        if let Err(err) = replication.replicate(activity, callback) {
            tracing::warn!(entity = %request.descriptor.entity, "replication unavailable: {err}");
        }
    }

    /// Records each passive's receipt of a client transaction in the order store.
    fn replicated_callback(&self, origin: &ClientOrigin) -> DeliveryCallback {
        let store = Arc::clone(&self.store);
        let (client, transaction) = (origin.client, origin.transaction);
        Arc::new(move |passive, outcome| {
            if outcome != DeliveryOutcome::Delivered {
                return;
            }
            if let Err(err) = store.record_replicated(client, transaction, passive) {
                tracing::warn!(client = %client, tx = %transaction, passive = %passive, "failed to record replication: {err}");
            }
        })
    }

    /// Schedules a follow-up and makes the parent's retirement wait for it.
    fn dispatch_follow_up(
        self: &Arc<Self>,
        parent: &ServerEntityRequest,
        version: EntityVersion,
        parent_token: CompletionToken,
        follow_up: FollowUp,
    ) {
        let entity = parent.descriptor.entity.clone();
        let manager = self.retirement_for(&entity);
        let token = self.tokens.next_token();
        if let Err(err) = manager.defer_retirement(parent_token, token) {
            tracing::error!(entity = %entity, parent = %parent_token, "cannot defer retirement: {err}");
            return;
        }
        let key = match self.registry.partition_key_for(&entity, &follow_up.payload) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(entity = %entity, "follow-up has no partition: {err}");
                parent.key
            }
        };
        let request = ServerEntityRequest {
            descriptor: EntityDescriptor::internal(entity.clone(), version),
            action: ServerEntityAction::Invoke,
            key,
            payload: follow_up.payload,
            source: self.local,
            origin: RequestOrigin::Internal,
        };
        tracing::trace!(entity = %entity, parent = %parent_token, token = %token, "follow-up scheduled");
        // Rejections are retired inside dispatch.
        let _ = self.dispatch(request, token);
    }

    /// Records `result` and answers every request retirement releases.
    fn complete(
        &self,
        request: &ServerEntityRequest,
        token: CompletionToken,
        result: Result<Bytes, EntityError>,
    ) {
        let entity = &request.descriptor.entity;
        let manager = self.retirement_for(entity);
        if let RequestOrigin::Client {
            client,
            transaction,
            ..
        } = request.origin
        {
            // Journaled even for a disconnected client so a resend is answered
            // instead of applied again.
            if let Err(err) = self.store.record_result(client, transaction, &result) {
                tracing::warn!(client = %client, tx = %transaction, "failed to journal result: {err}");
            }
            let mut results = lock(&self.results);
            if manager.has_client_waiter(token, client).unwrap_or(false) {
                results.insert((client, transaction), result);
            }
        }

        let retired = match manager.retire_for_completion(token) {
            Ok(retired) => retired,
            Err(err) => {
                tracing::error!(entity = %entity, token = %token, "retirement invariant violated: {err}");
                return;
            }
        };
        metrics::set_retirement_pending(manager.pending());
        for done in retired {
            self.acknowledge(&done);
        }
        self.prune_retirement(entity);
    }

    fn acknowledge(&self, request: &ServerEntityRequest) {
        let RequestOrigin::Client {
            client,
            transaction,
            ..
        } = request.origin
        else {
            return;
        };
        let Some(result) = lock(&self.results).remove(&(client, transaction)) else {
            tracing::debug!(client = %client, tx = %transaction, "no result to acknowledge");
            return;
        };
        self.reply(client, ServerAck::applied(transaction, &result));
        self.reply(client, ServerAck::retired(transaction));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::lanes::LanePool;
    use crate::daemon::repl::proto::{AckKind, AckOutcome};
    use crate::test_harness::{MemoryOrderStore, MemoryRegistry, RecordingClientChannels};
    use std::time::Duration;

    struct Fixture {
        ingress: TransactionIngress,
        registry: Arc<MemoryRegistry>,
        store: Arc<MemoryOrderStore>,
        clients: Arc<RecordingClientChannels>,
        pool: Option<LanePool>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(MemoryRegistry::new());
            let store = Arc::new(MemoryOrderStore::new());
            let clients = Arc::new(RecordingClientChannels::new());
            let pool = LanePool::start(2, 64).unwrap();
            let ingress = TransactionIngress::new(IngressParts {
                local: NodeId::random(),
                registry: registry.clone(),
                store: store.clone(),
                clients: clients.clone(),
                lanes: pool.scheduler(),
                replication: None,
                limits: Limits::default(),
            });
            Self {
                ingress,
                registry,
                store,
                clients,
                pool: Some(pool),
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(pool) = self.pool.take() {
                pool.shutdown();
            }
        }
    }

    fn map() -> EntityId {
        EntityId::new("Map", "a").unwrap()
    }

    fn request(action: ServerEntityAction, tx: u64, payload: &'static [u8]) -> ClientRequest {
        ClientRequest {
            descriptor: EntityDescriptor::internal(map(), EntityVersion::FIRST),
            transaction: TransactionId::new(tx),
            oldest_outstanding: TransactionId::new(1),
            action,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn invoke_is_received_applied_then_retired() {
        let fx = Fixture::new();
        fx.registry
            .create_entity(&map(), None, &Bytes::new())
            .unwrap();
        let client = ClientId::random();
        fx.ingress
            .submit(client, request(ServerEntityAction::Invoke, 1, b"k=1;put"))
            .unwrap();

        let acks = fx
            .clients
            .wait_for(client, 3, Duration::from_secs(5))
            .unwrap();
        let kinds: Vec<AckKind> = acks.iter().map(|ack| ack.kind).collect();
        assert_eq!(kinds, vec![AckKind::Received, AckKind::Applied, AckKind::Retired]);
        assert!(matches!(acks[1].outcome, AckOutcome::Result(_)));
        assert!(
            fx.store
                .journaled_result(client, TransactionId::new(1))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn unknown_entity_is_rejected_without_received() {
        let fx = Fixture::new();
        let client = ClientId::random();
        let err = fx
            .ingress
            .submit(client, request(ServerEntityAction::Invoke, 1, b"x"))
            .unwrap_err();
        assert!(matches!(err, EntityError::NotFound { .. }));
        let acks = fx.clients.acks(client);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].kind, AckKind::Applied);
        assert!(matches!(acks[0].outcome, AckOutcome::Error { .. }));
    }

    #[test]
    fn follow_up_delays_retirement() {
        let fx = Fixture::new();
        fx.registry
            .create_entity(&map(), None, &Bytes::new())
            .unwrap();
        let client = ClientId::random();
        fx.ingress
            .submit(
                client,
                request(ServerEntityAction::Invoke, 1, b"k=1;follow:k=2;tail"),
            )
            .unwrap();
        fx.clients
            .wait_for(client, 3, Duration::from_secs(5))
            .unwrap();
        // The follow-up ran before the parent retired.
        assert_eq!(
            fx.registry.applied(&map()),
            vec![
                Bytes::from_static(b"k=1;follow:k=2;tail"),
                Bytes::from_static(b"k=2;tail")
            ]
        );
        assert_eq!(fx.ingress.pending_retirements(&map()), 0);
    }

    #[test]
    fn resend_is_answered_from_journal() {
        let fx = Fixture::new();
        let client = ClientId::random();
        fx.store
            .record_applied_order(client, TransactionId::new(4), TransactionId::new(2))
            .unwrap();
        fx.store
            .record_result(client, TransactionId::new(4), &Ok(Bytes::from_static(b"done")))
            .unwrap();

        let answered = fx
            .ingress
            .handle_resend(client, request(ServerEntityAction::Invoke, 4, b"x"))
            .unwrap();
        assert_eq!(answered, ResendOutcome::Answered);
        assert_eq!(
            fx.clients.acks(client)[1].outcome,
            AckOutcome::Result(Bytes::from_static(b"done"))
        );

        let dropped = fx
            .ingress
            .handle_resend(client, request(ServerEntityAction::Invoke, 1, b"x"))
            .unwrap();
        assert_eq!(dropped, ResendOutcome::Dropped);
        assert!(fx.registry.applied(&map()).is_empty());
    }

    #[test]
    fn journal_survives_disconnect_until_forgotten() {
        let fx = Fixture::new();
        fx.registry
            .create_entity(&map(), None, &Bytes::new())
            .unwrap();
        let client = ClientId::random();
        fx.ingress
            .submit(client, request(ServerEntityAction::Invoke, 1, b"k=1;put"))
            .unwrap();
        fx.clients
            .wait_for(client, 3, Duration::from_secs(5))
            .unwrap();

        fx.ingress.client_disconnected(client).unwrap();
        let outcome = fx
            .ingress
            .handle_resend(client, request(ServerEntityAction::Invoke, 1, b"k=1;put"))
            .unwrap();
        assert_eq!(outcome, ResendOutcome::Answered);
        assert_eq!(fx.registry.applied(&map()).len(), 1);

        fx.ingress.forget_client(client).unwrap();
        assert!(
            fx.store
                .journaled_result(client, TransactionId::new(1))
                .unwrap()
                .is_none()
        );
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn in_flight_request_of_disconnected_client_is_journaled_once() {
        let fx = Fixture::new();
        fx.registry
            .create_entity(&map(), None, &Bytes::new())
            .unwrap();
        let client = ClientId::random();
        let (open, gate) = crossbeam::channel::bounded::<()>(0);
        fx.ingress
            .shared
            .lanes
            .submit(LaneJob::new(
                map(),
                crate::core::ConcurrencyKey::new(1),
                JobClass::Regular,
                move || {
                    let _ = gate.recv();
                },
                |_| {},
            ))
            .unwrap();
        fx.ingress
            .submit(client, request(ServerEntityAction::Invoke, 1, b"k=1;put"))
            .unwrap();
        assert_eq!(fx.ingress.client_disconnected(client).unwrap(), 1);
        drop(open);

        wait_until("journaled result", || {
            fx.store
                .journaled_result(client, TransactionId::new(1))
                .unwrap()
                .is_some()
        });
        let outcome = fx
            .ingress
            .handle_resend(client, request(ServerEntityAction::Invoke, 1, b"k=1;put"))
            .unwrap();
        assert_eq!(outcome, ResendOutcome::Answered);
        assert_eq!(fx.registry.applied(&map()), vec![Bytes::from_static(b"k=1;put")]);

        let kinds: Vec<AckKind> = fx.clients.acks(client).iter().map(|ack| ack.kind).collect();
        assert_eq!(
            kinds,
            vec![AckKind::Received, AckKind::Received, AckKind::Applied, AckKind::Retired]
        );
        wait_until("retirement", || fx.ingress.pending_retirements(&map()) == 0);
        assert!(lock(&fx.ingress.shared.results).is_empty());
    }

    #[test]
    fn destroyed_entity_drops_its_retirement_manager() {
        let fx = Fixture::new();
        fx.registry
            .create_entity(&map(), None, &Bytes::new())
            .unwrap();
        let client = ClientId::random();
        fx.ingress
            .submit(client, request(ServerEntityAction::Invoke, 1, b"k=1;put"))
            .unwrap();
        fx.clients
            .wait_for(client, 3, Duration::from_secs(5))
            .unwrap();
        assert!(lock(&fx.ingress.shared.retirement).contains_key(&map()));

        fx.ingress
            .submit(client, request(ServerEntityAction::Destroy, 2, b""))
            .unwrap();
        fx.clients
            .wait_for(client, 6, Duration::from_secs(5))
            .unwrap();
        wait_until("pruned manager", || {
            !lock(&fx.ingress.shared.retirement).contains_key(&map())
        });
        assert!(fx.registry.get_entity(&map()).is_none());
    }

    #[test]
    fn load_existing_entities_follows_creation_order() {
        let fx = Fixture::new();
        let a = EntityId::new("Map", "a").unwrap();
        let b = EntityId::new("Map", "b").unwrap();
        fx.store
            .record_entity_created(&b, EntityVersion::new(3), &Bytes::new())
            .unwrap();
        fx.store
            .record_entity_created(&a, EntityVersion::new(1), &Bytes::new())
            .unwrap();
        assert_eq!(fx.ingress.load_existing_entities().unwrap(), 2);
        let order: Vec<EntityId> = fx
            .registry
            .entities()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(order, vec![b, a]);
    }
}
