//! Byte-stream plumbing: one framed writer per peer, and an inbound pump that
//! splits a peer's stream into envelopes and ack batches.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};

use crossbeam::channel::Sender;

use super::error::ReplError;
use super::frame::{FrameReader, FrameWriter};
use super::proto::{ReplEnvelope, ReplMessage};
use super::sender::SenderHandle;
use crate::core::{Limits, NodeId};
use crate::daemon::collab::{ReplicationTransport, TransportError};

type PeerWriter = FrameWriter<Box<dyn Write + Send>>;

/// `ReplicationTransport` over framed byte streams.
pub struct StreamTransport {
    max_frame_bytes: usize,
    peers: Mutex<HashMap<NodeId, PeerWriter>>,
}

impl StreamTransport {
    pub fn new(limits: &Limits) -> Self {
        Self {
            max_frame_bytes: limits.max_frame_bytes,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn connect(&self, peer: NodeId, writer: Box<dyn Write + Send>) {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.insert(peer, FrameWriter::new(writer, self.max_frame_bytes));
    }

    pub fn disconnect(&self, peer: NodeId) -> bool {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers.remove(&peer).is_some()
    }
}

impl ReplicationTransport for StreamTransport {
    fn send(&self, peer: NodeId, message: ReplMessage) -> Result<(), TransportError> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = peers
            .get_mut(&peer)
            .ok_or(TransportError::Disconnected(peer))?;
        if let Err(err) = writer.write_message(&message) {
            // A half-written frame leaves the stream unusable.
            peers.remove(&peer);
            return Err(TransportError::SendFailed {
                peer,
                reason: err.to_string(),
            });
        }
        Ok(())
    }
}

/// Reads `reader` until end of stream, routing activities to the receiver
/// channel and ack batches to the sender.
pub fn pump_inbound<R: Read>(
    reader: R,
    limits: &Limits,
    envelopes: Option<&Sender<ReplEnvelope>>,
    acks: Option<&SenderHandle>,
) -> Result<(), ReplError> {
    let mut frames = FrameReader::new(reader, limits.max_frame_bytes);
    while let Some(message) = frames.read_message(limits)? {
        match message {
            ReplMessage::Activity(envelope) => match envelopes {
                Some(tx) => tx.send(envelope).map_err(|_| ReplError::Closed)?,
                None => {
                    return Err(ReplError::sync_protocol(format!(
                        "activity from {} on a node that is not passive",
                        envelope.source
                    )));
                }
            },
            ReplMessage::Acks(batch) => match acks {
                Some(handle) => handle.deliver_acks(batch)?,
                None => {
                    tracing::debug!(source = %batch.source, "dropping acks on a passive node");
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::repl::activity::SyncReplicationActivity;
    use crate::daemon::repl::frame::FrameWriter;
    use std::io::Cursor;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transport_frames_reach_the_pump() {
        let limits = Limits::default();
        let transport = StreamTransport::new(&limits);
        let passive = NodeId::random();
        let buf = SharedBuf::default();
        transport.connect(passive, Box::new(buf.clone()));

        let envelope = ReplEnvelope {
            source: NodeId::random(),
            sequence: 1,
            activity: SyncReplicationActivity::noop(),
        };
        transport
            .send(passive, ReplMessage::Activity(envelope.clone()))
            .unwrap();

        let (tx, rx) = crossbeam::channel::unbounded();
        let bytes = buf.0.lock().unwrap().clone();
        pump_inbound(Cursor::new(bytes), &limits, Some(&tx), None).unwrap();
        assert_eq!(rx.try_recv().unwrap(), envelope);
    }

    #[test]
    fn unknown_peer_is_disconnected() {
        let transport = StreamTransport::new(&Limits::default());
        let peer = NodeId::random();
        assert_eq!(
            transport.send(peer, ReplMessage::Activity(ReplEnvelope {
                source: peer,
                sequence: 1,
                activity: SyncReplicationActivity::noop(),
            })),
            Err(TransportError::Disconnected(peer))
        );
    }

    #[test]
    fn activity_on_active_is_rejected() {
        let limits = Limits::default();
        let mut writer = FrameWriter::new(Vec::new(), limits.max_frame_bytes);
        writer
            .write_message(&ReplMessage::Activity(ReplEnvelope {
                source: NodeId::random(),
                sequence: 1,
                activity: SyncReplicationActivity::end_sync(),
            }))
            .unwrap();
        let err = pump_inbound(Cursor::new(writer.into_inner()), &limits, None, None).unwrap_err();
        assert!(err.is_fatal());
    }
}
