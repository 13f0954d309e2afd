//! Best-effort group delivery over UDP.
//!
//! Small envelopes for every member (pings and sequenced updates) go out as
//! single datagrams, either to a real IP multicast group or fanned out to
//! each member's UDP port. Loss is tolerated: receivers detect gaps in the
//! update sequence and ask for a resend over TCP.

use crate::config::{MulticastConfig, MulticastMode};
use crate::error::{NetworkError, Result};
use crate::metrics::TransportMetrics;
use crate::network::frame::{decode_frame, encode_frame, PayloadType};
use crate::network::message::{decode_envelope, encode_envelope, Envelope};
use crate::network::server::EnvelopeHandler;
use crate::types::ClusterNodeAddress;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// UDP socket shared by the sending and receiving side.
pub struct Multicast {
    socket: UdpSocket,
    mode: MulticastMode,
    frame_size: usize,
    local: ClusterNodeAddress,
    metrics: Arc<TransportMetrics>,
}

impl Multicast {
    /// Bind the UDP socket. In fan-out mode it shares the TCP port; in group
    /// mode it binds the group port and joins the group.
    pub async fn bind(
        local: ClusterNodeAddress,
        config: &MulticastConfig,
        frame_size: usize,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self> {
        let socket = match config.mode {
            MulticastMode::UdpFanout => {
                UdpSocket::bind(local.socket_addr()).await.map_err(NetworkError::Io)?
            }
            MulticastMode::Group(group) => {
                let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
                let socket = UdpSocket::bind(bind).await.map_err(NetworkError::Io)?;
                match group.ip() {
                    IpAddr::V4(ip) => {
                        socket
                            .join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)
                            .map_err(NetworkError::Io)?;
                        socket.set_multicast_loop_v4(true).map_err(NetworkError::Io)?;
                    }
                    IpAddr::V6(ip) => {
                        socket.join_multicast_v6(&ip, 0).map_err(NetworkError::Io)?;
                    }
                }
                socket
            }
        };
        debug!(local = %local, mode = ?config.mode, "Multicast socket bound");

        Ok(Self {
            socket,
            mode: config.mode,
            frame_size,
            local,
            metrics,
        })
    }

    /// Largest frame sent as a datagram.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Encode an envelope as a datagram, or `None` when it does not fit.
    /// Receivers refuse to inflate past the datagram size, so the payload must
    /// fit before compression too.
    pub fn encode(&self, envelope: &Envelope) -> Option<Bytes> {
        let payload = encode_envelope(envelope).ok()?;
        if payload.len() > self.frame_size {
            return None;
        }
        encode_frame(PayloadType::Message, &payload, self.frame_size).ok()
    }

    /// Send a frame to every member but this node. Returns the number of
    /// datagrams written.
    pub async fn send(&self, frame: &[u8], members: &[ClusterNodeAddress]) -> usize {
        let targets: Vec<SocketAddr> = match self.mode {
            MulticastMode::Group(group) => vec![group],
            MulticastMode::UdpFanout => members
                .iter()
                .filter(|m| **m != self.local)
                .map(ClusterNodeAddress::socket_addr)
                .collect(),
        };

        let mut sent = 0;
        for target in targets {
            match self.socket.send_to(frame, target).await {
                Ok(_) => {
                    self.metrics.datagrams_sent.inc();
                    sent += 1;
                }
                Err(e) => trace!(%target, error = %e, "Datagram send failed"),
            }
        }
        sent
    }

    /// Receive datagrams until `cancel` fires.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn EnvelopeHandler>, cancel: CancellationToken) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    trace!(error = %e, "Datagram receive failed");
                    continue;
                }
            };
            self.metrics.datagrams_received.inc();

            match self.decode(&buf[..len]) {
                Ok(envelope) if envelope.sender == self.local => {}
                Ok(envelope) => handler.deliver(envelope),
                Err(e) => warn!(%from, error = %e, "Dropping malformed datagram"),
            }
        }
        debug!(local = %self.local, "Multicast receiver stopped");
    }

    fn decode(&self, datagram: &[u8]) -> std::result::Result<Envelope, NetworkError> {
        let frame = decode_frame(datagram, self.frame_size)?;
        if frame.payload_type != PayloadType::Message {
            return Err(NetworkError::MalformedFrame("handshake over multicast".into()));
        }
        decode_envelope(&frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Time;
    use crate::network::message::{Message, ProcessorKey};
    use parking_lot::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Envelope>>);

    impl EnvelopeHandler for Collect {
        fn deliver(&self, envelope: Envelope) {
            self.0.lock().push(envelope);
        }
    }

    async fn bind_free() -> Multicast {
        let spare = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = spare.local_addr().unwrap();
        drop(spare);
        Multicast::bind(
            ClusterNodeAddress::from(addr),
            &MulticastConfig::default(),
            1460,
            Arc::new(TransportMetrics::new()),
        )
        .await
        .unwrap()
    }

    fn envelope(sender: &ClusterNodeAddress, body: Message) -> Envelope {
        Envelope {
            cluster_id: Uuid::nil(),
            sender: sender.clone(),
            sent_at: Time::ZERO,
            destination: ProcessorKey::Cluster,
            body,
        }
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_members() {
        let a = Arc::new(bind_free().await);
        let b = Arc::new(bind_free().await);
        let collected = Arc::new(Collect::default());
        let cancel = CancellationToken::new();
        tokio::spawn(b.clone().run(collected.clone(), cancel.clone()));

        let frame = a
            .encode(&envelope(&a.local, Message::Ping { epoch: 1, seq: 9 }))
            .unwrap();
        let members = vec![a.local.clone(), b.local.clone()];
        assert_eq!(a.send(&frame, &members).await, 1);

        let got = crate::testing::wait_for_result(
            || async { collected.0.lock().len() },
            |n| *n == 1,
            Duration::from_secs(5),
        )
        .await;
        assert!(got.is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_oversized_envelope_does_not_fit() {
        let a = bind_free().await;
        let big = Message::ReplicaSync {
            bucket: 0,
            entries: (0..200)
                .map(|i| crate::rebalancing::TransferEntry {
                    key: Bytes::from(format!("key-{i}-{}", i * 7919)),
                    value: Bytes::from(Uuid::new_v4().to_string()),
                    created: Time::ZERO,
                    expiration: None,
                })
                .collect(),
            reset: true,
        };
        assert!(a.encode(&envelope(&a.local, big)).is_none());
        assert!(a
            .encode(&envelope(&a.local, Message::Ping { epoch: 0, seq: 0 }))
            .is_some());
    }
}
