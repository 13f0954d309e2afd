//! TCP server accepting peer connections.

use crate::config::TransportConfig;
use crate::error::{NetworkError, Result};
use crate::metrics::TransportMetrics;
use crate::network::frame::{encode_frame, read_frame, write_frame, PayloadType, PROTOCOL_VERSION};
use crate::network::message::{decode_envelope, decode_handshake, encode_ack, Envelope, HandshakeAck};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Receives envelopes read from connections and datagrams.
///
/// Called from I/O tasks; implementations only enqueue.
pub trait EnvelopeHandler: Send + Sync + 'static {
    fn deliver(&self, envelope: Envelope);
}

/// Accepts connections and feeds their envelopes to a handler.
pub struct NetworkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    cluster_name: String,
    config: TransportConfig,
    metrics: Arc<TransportMetrics>,
}

impl NetworkServer {
    /// Bind the listening socket. Binding to port 0 picks a free port; see
    /// [`local_addr`](Self::local_addr).
    pub async fn bind(
        addr: SocketAddr,
        cluster_name: impl Into<String>,
        config: TransportConfig,
        metrics: Arc<TransportMetrics>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(NetworkError::Io)?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        Ok(Self {
            listener,
            local_addr,
            cluster_name: cluster_name.into(),
            config,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `cancel` fires.
    pub async fn run(self, handler: Arc<dyn EnvelopeHandler>, cancel: CancellationToken) {
        info!(addr = %self.local_addr, "Network server listening");
        let shared = Arc::new(ConnectionContext {
            cluster_name: self.cluster_name,
            config: self.config,
            metrics: self.metrics,
            handler,
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(addr = %self.local_addr, "Network server shutting down");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            trace!(peer = %peer_addr, "Accepted connection");
                            let shared = shared.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    result = handle_connection(stream, &shared) => {
                                        if let Err(e) = result {
                                            debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }
    }
}

struct ConnectionContext {
    cluster_name: String,
    config: TransportConfig,
    metrics: Arc<TransportMetrics>,
    handler: Arc<dyn EnvelopeHandler>,
}

async fn handle_connection(
    mut stream: TcpStream,
    ctx: &ConnectionContext,
) -> std::result::Result<(), NetworkError> {
    let max = ctx.config.max_frame_size;

    let first = match timeout(ctx.config.connect_timeout, read_frame(&mut stream, max)).await {
        Err(_) => return Err(NetworkError::SendFailed("handshake timeout".into())),
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(NetworkError::ProtocolMismatch(reason))) => {
            reject(&mut stream, ctx, reason.clone()).await;
            return Err(NetworkError::ProtocolMismatch(reason));
        }
        Ok(Err(e)) => return Err(e),
    };
    if first.payload_type != PayloadType::Handshake {
        reject(&mut stream, ctx, "expected handshake".into()).await;
        return Err(NetworkError::MalformedFrame("expected handshake".into()));
    }

    let handshake = decode_handshake(&first.payload)?;
    if handshake.version != PROTOCOL_VERSION || handshake.cluster_name != ctx.cluster_name {
        let reason = format!(
            "peer speaks {} v{}, expected {} v{}",
            handshake.cluster_name, handshake.version, ctx.cluster_name, PROTOCOL_VERSION
        );
        warn!(peer = %handshake.sender, %reason, "Rejecting connection");
        reject(&mut stream, ctx, reason.clone()).await;
        return Err(NetworkError::ProtocolMismatch(reason));
    }
    send_ack(&mut stream, ctx, HandshakeAck { accepted: true, reason: None }).await?;
    debug!(peer = %handshake.sender, "Connection accepted");

    while let Some(frame) = read_frame(&mut stream, max).await? {
        ctx.metrics.frames_received.inc();
        if frame.payload_type != PayloadType::Message {
            return Err(NetworkError::MalformedFrame("unexpected handshake".into()));
        }
        let envelope = decode_envelope(&frame.payload)?;
        ctx.handler.deliver(envelope);
    }
    trace!(peer = %handshake.sender, "Connection closed by peer");
    Ok(())
}

async fn reject(stream: &mut TcpStream, ctx: &ConnectionContext, reason: String) {
    ctx.metrics.handshakes_rejected.inc();
    let ack = HandshakeAck {
        accepted: false,
        reason: Some(reason),
    };
    let _ = send_ack(stream, ctx, ack).await;
}

async fn send_ack(
    stream: &mut TcpStream,
    ctx: &ConnectionContext,
    ack: HandshakeAck,
) -> std::result::Result<(), NetworkError> {
    let frame = encode_frame(PayloadType::Handshake, &encode_ack(&ack)?, ctx.config.max_frame_size)?;
    write_frame(stream, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Time;
    use crate::metrics::TransportMetrics;
    use crate::network::message::{Message, ProcessorKey};
    use crate::network::transport::Transport;
    use crate::types::ClusterNodeAddress;
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

    fn ping(sender: &ClusterNodeAddress, seq: u64) -> Envelope {
        Envelope {
            cluster_id: Uuid::nil(),
            sender: sender.clone(),
            sent_at: Time::ZERO,
            destination: ProcessorKey::Cluster,
            body: Message::Ping { epoch: 1, seq },
        }
    }

    async fn start_server(cluster: &str) -> (SocketAddr, Arc<Collect>, Arc<TransportMetrics>, CancellationToken) {
        let metrics = Arc::new(TransportMetrics::new());
        let server = NetworkServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            cluster,
            TransportConfig::default(),
            metrics.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let collected = Arc::new(Collect::default());
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(collected.clone(), cancel.clone()));
        (addr, collected, metrics, cancel)
    }

    #[tokio::test]
    async fn test_envelopes_arrive_in_order() {
        let (addr, collected, server_metrics, cancel) = start_server("test").await;

        let local = ClusterNodeAddress::from("127.0.0.1:1".parse::<SocketAddr>().unwrap());
        let (transport, _failures) = Transport::new(
            local.clone(),
            "test",
            TransportConfig::default(),
            Arc::new(TransportMetrics::new()),
            &cancel,
        );
        let peer = ClusterNodeAddress::from(addr);
        for seq in 0..50 {
            transport.send(&peer, ping(&local, seq)).unwrap();
        }

        let done = crate::testing::wait_for_result(
            || async { collected.0.lock().len() },
            |n| *n == 50,
            Duration::from_secs(5),
        )
        .await;
        assert!(done.is_some());

        let seqs: Vec<u64> = collected
            .0
            .lock()
            .iter()
            .map(|e| match e.body {
                Message::Ping { seq, .. } => seq,
                _ => u64::MAX,
            })
            .collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        assert_eq!(server_metrics.frames_received.get(), 50);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cluster_name_mismatch_is_rejected() {
        let (addr, collected, server_metrics, cancel) = start_server("blue").await;

        let local = ClusterNodeAddress::from("127.0.0.1:1".parse::<SocketAddr>().unwrap());
        let config = TransportConfig::default()
            .with_max_retries(3)
            .with_retry_delay(Duration::from_millis(10));
        let (transport, mut failures) = Transport::new(
            local.clone(),
            "green",
            config,
            Arc::new(TransportMetrics::new()),
            &cancel,
        );
        transport.send(&ClusterNodeAddress::from(addr), ping(&local, 0)).unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(failure.reason.contains("protocol mismatch"));
        assert!(collected.0.lock().is_empty());
        // A mismatch is not retried.
        assert_eq!(server_metrics.handshakes_rejected.get(), 1);
        cancel.cancel();
    }
}
