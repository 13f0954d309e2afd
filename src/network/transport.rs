//! Reliable ordered delivery to peers.
//!
//! Each peer gets its own outbound queue drained by a single writer task, so
//! envelopes reach a given peer in the order they were sent. A writer keeps
//! one connection open, retries failed writes with a fresh connection and
//! reports envelopes it could not deliver on the failure channel.
//!
//! Envelopes are framed before they are queued. An envelope that cannot be
//! encoded (too large for a frame, not serializable) is refused by
//! [`Transport::send`] and never reported as a delivery failure, since the
//! peer is not at fault.

use crate::config::TransportConfig;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::TransportMetrics;
use crate::network::frame::{encode_frame, read_frame, write_frame, PayloadType, PROTOCOL_VERSION};
use crate::network::message::{decode_ack, encode_envelope, encode_handshake, Envelope, Handshake};
use crate::types::ClusterNodeAddress;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// An envelope the transport gave up on.
#[derive(Debug)]
pub struct Undeliverable {
    pub to: ClusterNodeAddress,
    pub envelope: Envelope,
    pub reason: String,
}

/// An envelope and its encoded frame.
struct Outbound {
    envelope: Envelope,
    frame: Bytes,
}

struct PeerSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Settings shared by every peer writer.
struct WriterContext {
    local: ClusterNodeAddress,
    cluster_name: String,
    config: TransportConfig,
    failures: mpsc::UnboundedSender<Undeliverable>,
    metrics: Arc<TransportMetrics>,
}

/// Outbound side of the messaging layer.
pub struct Transport {
    ctx: Arc<WriterContext>,
    peers: DashMap<ClusterNodeAddress, PeerSender>,
    cancel: CancellationToken,
}

impl Transport {
    /// Create a transport. Undeliverable envelopes are reported on the
    /// returned receiver.
    pub fn new(
        local: ClusterNodeAddress,
        cluster_name: impl Into<String>,
        config: TransportConfig,
        metrics: Arc<TransportMetrics>,
        parent: &CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Undeliverable>) {
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(WriterContext {
            local,
            cluster_name: cluster_name.into(),
            config,
            failures,
            metrics,
        });
        let transport = Self {
            ctx,
            peers: DashMap::new(),
            cancel: parent.child_token(),
        };
        (transport, failures_rx)
    }

    pub fn local(&self) -> &ClusterNodeAddress {
        &self.ctx.local
    }

    pub fn config(&self) -> &TransportConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.ctx.metrics
    }

    /// Encode an envelope and queue it for `to`. Never blocks.
    ///
    /// Fails with [`NetworkError::FrameTooLarge`] or
    /// [`NetworkError::Serialization`] when the envelope cannot be framed.
    pub fn send(&self, to: &ClusterNodeAddress, envelope: Envelope) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let frame = encode_envelope(&envelope)
            .and_then(|payload| encode_frame(PayloadType::Message, &payload, self.ctx.config.max_frame_size))
            .map_err(|e| {
                warn!(peer = %to, message = envelope.body.name(), error = %e, "Cannot encode envelope");
                e
            })?;
        let outbound = Outbound { envelope, frame };

        let mut peer = self
            .peers
            .entry(to.clone())
            .or_insert_with(|| self.spawn_writer(to));
        if let Err(mpsc::error::SendError(returned)) = peer.tx.send(outbound) {
            // The writer exited; replace it.
            *peer = self.spawn_writer(to);
            peer.tx
                .send(returned)
                .map_err(|_| NetworkError::SendFailed("peer writer closed".into()))?;
        }
        Ok(())
    }

    /// Close the connection to `to` once its queue drains.
    pub fn disconnect(&self, to: &ClusterNodeAddress) {
        if self.peers.remove(to).is_some() {
            debug!(local = %self.ctx.local, peer = %to, "Peer writer released");
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Stop every writer. Queued envelopes are dropped.
    pub fn shutdown(&self) {
        info!(local = %self.ctx.local, "Shutting down transport");
        self.cancel.cancel();
        self.peers.clear();
    }

    fn spawn_writer(&self, to: &ClusterNodeAddress) -> PeerSender {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = self.ctx.clone();
        let cancel = self.cancel.child_token();
        let peer = to.clone();
        tokio::spawn(async move {
            writer_loop(ctx, peer, rx, cancel).await;
        });
        PeerSender { tx }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local", &self.ctx.local)
            .field("peer_count", &self.peer_count())
            .field("config", &self.ctx.config)
            .finish()
    }
}

/// Background loop that writes one peer's queue with retry logic.
async fn writer_loop(
    ctx: Arc<WriterContext>,
    to: ClusterNodeAddress,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    trace!(local = %ctx.local, peer = %to, "Peer writer started");
    let mut connection: Option<TcpStream> = None;

    loop {
        let Outbound { envelope, frame } = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outbound = rx.recv() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let mut attempts = 0;
        let mut last_error = None;
        while attempts < ctx.config.max_retries.max(1) {
            attempts += 1;
            match timeout(ctx.config.write_timeout, send_frame(&ctx, &to, &mut connection, &frame)).await {
                Ok(Ok(())) => {
                    trace!(peer = %to, message = envelope.body.name(), "Envelope sent");
                    ctx.metrics.messages_sent.inc();
                    last_error = None;
                    break;
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => last_error = Some(NetworkError::SendFailed("send timeout".into())),
            }

            if connection.take().is_some() {
                ctx.metrics.active_connections.dec();
            }
            ctx.metrics.connections_failed.inc();

            if let Some(NetworkError::ProtocolMismatch(_)) = &last_error {
                break;
            }
            if attempts < ctx.config.max_retries {
                debug!(peer = %to, attempt = attempts, "Retrying send");
                sleep(ctx.config.retry_delay).await;
            }
        }

        if let Some(e) = last_error {
            warn!(
                peer = %to,
                message = envelope.body.name(),
                attempts,
                error = %e,
                "Failed to send envelope after all retries"
            );
            fail(&ctx, to.clone(), envelope, e.to_string());
        }
    }

    if connection.take().is_some() {
        ctx.metrics.active_connections.dec();
    }
    trace!(local = %ctx.local, peer = %to, "Peer writer exited");
}

fn fail(ctx: &WriterContext, to: ClusterNodeAddress, envelope: Envelope, reason: String) {
    ctx.metrics.messages_failed.inc();
    let _ = ctx.failures.send(Undeliverable {
        to,
        envelope,
        reason,
    });
}

async fn send_frame(
    ctx: &WriterContext,
    to: &ClusterNodeAddress,
    connection: &mut Option<TcpStream>,
    frame: &Bytes,
) -> std::result::Result<(), NetworkError> {
    if connection.is_none() {
        *connection = Some(connect(ctx, to).await?);
    }
    let stream = connection.as_mut().ok_or(NetworkError::ConnectionClosed)?;
    write_frame(stream, frame).await
}

/// Open a connection and complete the handshake.
async fn connect(ctx: &WriterContext, to: &ClusterNodeAddress) -> std::result::Result<TcpStream, NetworkError> {
    let addr = to.socket_addr();
    let mut stream = timeout(ctx.config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetworkError::ConnectionFailed {
            addr: addr.to_string(),
            reason: "connection timeout".to_string(),
        })?
        .map_err(|e| NetworkError::ConnectionFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;

    let handshake = Handshake {
        cluster_name: ctx.cluster_name.clone(),
        version: PROTOCOL_VERSION,
        sender: ctx.local.clone(),
    };
    let frame = encode_frame(
        PayloadType::Handshake,
        &encode_handshake(&handshake)?,
        ctx.config.max_frame_size,
    )?;
    write_frame(&mut stream, &frame).await?;

    let ack = timeout(ctx.config.connect_timeout, read_frame(&mut stream, ctx.config.max_frame_size))
        .await
        .map_err(|_| NetworkError::ConnectionFailed {
            addr: addr.to_string(),
            reason: "handshake timeout".to_string(),
        })??
        .ok_or(NetworkError::ConnectionClosed)?;
    if ack.payload_type != PayloadType::Handshake {
        return Err(NetworkError::MalformedFrame("expected handshake ack".into()));
    }
    let ack = decode_ack(&ack.payload)?;
    if !ack.accepted {
        return Err(NetworkError::ProtocolMismatch(
            ack.reason.unwrap_or_else(|| "handshake rejected".into()),
        ));
    }

    ctx.metrics.connections_created.inc();
    ctx.metrics.active_connections.inc();
    debug!(local = %ctx.local, peer = %to, "Connection established");
    Ok(stream)
}
