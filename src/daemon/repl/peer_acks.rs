//! Passive ACK tracking on the active.
//!
//! Every forwarded envelope is in flight until the passive reports COMPLETED.
//! RECEIVED fires the envelope's delivery callback. The completed low-water
//! mark tells the active how far each passive has caught up; a passive that
//! leaves an envelope uncompleted past the ack timeout is marked degraded.
//! Client retirement never waits on any of this.
//!
//! Envelopes are kept until RECEIVED. A failed send or a reconnect sets a
//! resend point, and everything unreceived from there on is replayed in
//! sequence order; the passive drops the copies it already applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::proto::{ReplAckKind, ReplEnvelope, ReplicationAck};
use crate::core::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The passive acknowledged receipt.
    Delivered,
    /// Suppressed by the sync filter; nothing was sent.
    Filtered,
    /// Rejected before sending, or the passive was removed before it
    /// acknowledged receipt.
    Failed,
}

pub type DeliveryCallback = Arc<dyn Fn(NodeId, DeliveryOutcome) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerAckError {
    #[error("ack from unknown passive {0}")]
    UnknownPeer(NodeId),
    #[error("ack from {peer} for seq {sequence} beyond highest sent {highest_sent}")]
    AckBeyondSent {
        peer: NodeId,
        sequence: u64,
        highest_sent: u64,
    },
}

struct InFlight {
    sent_at: Instant,
    received: bool,
    /// Dropped once RECEIVED arrives.
    envelope: Option<ReplEnvelope>,
    callback: Option<DeliveryCallback>,
}

#[derive(Default)]
struct PassiveAcks {
    in_flight: BTreeMap<u64, InFlight>,
    highest_sent: u64,
    degraded: bool,
    /// First sequence that has to go out again.
    resend_from: Option<u64>,
}

impl PassiveAcks {
    fn resend_from(&mut self, sequence: u64) {
        self.resend_from = Some(self.resend_from.map_or(sequence, |from| from.min(sequence)));
    }
}

impl PassiveAcks {
    fn low_water_mark(&self) -> u64 {
        match self.in_flight.keys().next() {
            Some(first) => first - 1,
            None => self.highest_sent,
        }
    }
}

/// Snapshot of one passive's replication progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassiveProgress {
    pub highest_sent: u64,
    pub completed_through: u64,
    pub in_flight: usize,
    pub degraded: bool,
    pub resend_pending: bool,
}

pub struct PassiveAckTracker {
    passives: HashMap<NodeId, PassiveAcks>,
    timeout: Duration,
}

impl PassiveAckTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            passives: HashMap::new(),
            timeout,
        }
    }

    pub fn add_passive(&mut self, peer: NodeId) {
        self.passives.entry(peer).or_default();
    }

    /// Forgets a passive, failing everything still awaiting RECEIVED.
    pub fn remove_passive(&mut self, peer: NodeId) {
        let Some(acks) = self.passives.remove(&peer) else {
            return;
        };
        for (_, entry) in acks.in_flight {
            if !entry.received
                && let Some(callback) = entry.callback
            {
                callback(peer, DeliveryOutcome::Failed);
            }
        }
    }

    /// Tracks `envelope` before it is handed to the transport.
    pub fn record_sent(
        &mut self,
        peer: NodeId,
        envelope: ReplEnvelope,
        now: Instant,
        callback: Option<DeliveryCallback>,
    ) -> Result<(), PeerAckError> {
        let acks = self
            .passives
            .get_mut(&peer)
            .ok_or(PeerAckError::UnknownPeer(peer))?;
        let sequence = envelope.sequence;
        acks.highest_sent = acks.highest_sent.max(sequence);
        acks.in_flight.insert(
            sequence,
            InFlight {
                sent_at: now,
                received: false,
                envelope: Some(envelope),
                callback,
            },
        );
        Ok(())
    }

    /// Applies one ack. Acks for already-completed sequences are ignored.
    pub fn record_ack(&mut self, peer: NodeId, ack: ReplicationAck) -> Result<(), PeerAckError> {
        let acks = self
            .passives
            .get_mut(&peer)
            .ok_or(PeerAckError::UnknownPeer(peer))?;
        if ack.sequence > acks.highest_sent {
            return Err(PeerAckError::AckBeyondSent {
                peer,
                sequence: ack.sequence,
                highest_sent: acks.highest_sent,
            });
        }
        match ack.kind {
            ReplAckKind::Received => {
                if let Some(entry) = acks.in_flight.get_mut(&ack.sequence)
                    && !entry.received
                {
                    entry.received = true;
                    entry.envelope = None;
                    if let Some(callback) = entry.callback.take() {
                        callback(peer, DeliveryOutcome::Delivered);
                    }
                }
            }
            ReplAckKind::Completed(result) => {
                if let Some(mut entry) = acks.in_flight.remove(&ack.sequence) {
                    if !entry.received
                        && let Some(callback) = entry.callback.take()
                    {
                        callback(peer, DeliveryOutcome::Delivered);
                    }
                    tracing::trace!(passive = %peer, seq = ack.sequence, ?result, "completed");
                }
            }
        }
        Ok(())
    }

    /// A send the transport rejected; it and everything after it go out again.
    pub fn record_failed(&mut self, peer: NodeId, sequence: u64) {
        if let Some(acks) = self.passives.get_mut(&peer) {
            acks.resend_from(sequence);
        }
    }

    /// The stream to `peer` was replaced; whatever it has not acknowledged as
    /// received may have been lost with the old one.
    pub fn rewind(&mut self, peer: NodeId) {
        if let Some(acks) = self.passives.get_mut(&peer)
            && let Some((&first, _)) = acks.in_flight.iter().find(|(_, entry)| !entry.received)
        {
            acks.resend_from(first);
        }
    }

    pub fn needs_resend(&self, peer: NodeId) -> bool {
        self.passives
            .get(&peer)
            .is_some_and(|acks| acks.resend_from.is_some())
    }

    pub fn resend_pending(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .passives
            .iter()
            .filter(|(_, acks)| acks.resend_from.is_some())
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Unreceived envelopes from the resend point on, in sequence order.
    pub fn resend_backlog(&self, peer: NodeId) -> Vec<ReplEnvelope> {
        let Some(acks) = self.passives.get(&peer) else {
            return Vec::new();
        };
        let Some(from) = acks.resend_from else {
            return Vec::new();
        };
        acks.in_flight
            .range(from..)
            .filter_map(|(_, entry)| entry.envelope.clone())
            .collect()
    }

    /// Outcome of replaying the backlog: `stalled_at` is the first sequence
    /// the transport rejected again, `None` when everything went out.
    pub fn record_resent(&mut self, peer: NodeId, stalled_at: Option<u64>, now: Instant) {
        let Some(acks) = self.passives.get_mut(&peer) else {
            return;
        };
        let Some(from) = acks.resend_from.take() else {
            return;
        };
        let through = stalled_at.unwrap_or(u64::MAX).max(from);
        for (_, entry) in acks.in_flight.range_mut(from..through) {
            if entry.envelope.is_some() {
                entry.sent_at = now;
            }
        }
        acks.resend_from = stalled_at;
    }

    /// Every sequence at or below the mark has completed on `peer`.
    pub fn low_water_mark(&self, peer: NodeId) -> Option<u64> {
        self.passives.get(&peer).map(PassiveAcks::low_water_mark)
    }

    pub fn progress(&self, peer: NodeId) -> Option<PassiveProgress> {
        self.passives.get(&peer).map(|acks| PassiveProgress {
            highest_sent: acks.highest_sent,
            completed_through: acks.low_water_mark(),
            in_flight: acks.in_flight.len(),
            degraded: acks.degraded,
            resend_pending: acks.resend_from.is_some(),
        })
    }

    pub fn is_degraded(&self, peer: NodeId) -> bool {
        self.passives.get(&peer).is_some_and(|acks| acks.degraded)
    }

    /// Returns true if the passive was not degraded before.
    pub fn mark_degraded(&mut self, peer: NodeId) -> bool {
        match self.passives.get_mut(&peer) {
            Some(acks) if !acks.degraded => {
                acks.degraded = true;
                true
            }
            _ => false,
        }
    }

    /// Marks passives whose oldest in-flight envelope exceeded the timeout.
    /// Returns the passives that became degraded on this call.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<NodeId> {
        let mut newly = Vec::new();
        for (peer, acks) in &mut self.passives {
            if acks.degraded {
                continue;
            }
            let overdue = acks
                .in_flight
                .values()
                .next()
                .is_some_and(|oldest| now.saturating_duration_since(oldest.sent_at) > self.timeout);
            if overdue {
                acks.degraded = true;
                newly.push(*peer);
            }
        }
        newly.sort();
        newly
    }

    pub fn passives(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.passives.keys().copied()
    }
}
