//! Analysis peer server implementation

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use framelink_core::{
    AnalysisPayload, FramelinkError, FramelinkResult, InboundMessage, OutboundMessage,
};
use framelink_media::decode_data_url;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use uuid::Uuid;

/// Port analysis backends conventionally listen on
pub const DEFAULT_PEER_PORT: u16 = 8000;

/// Peer behaviour knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Send a `ping` when a client has been silent this long
    pub idle_ping: Option<Duration>,
    /// Drop every connection without a close handshake after this many
    /// frames, to exercise client reconnection
    pub drop_after_frames: Option<u64>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), DEFAULT_PEER_PORT),
            idle_ping: Some(Duration::from_secs(30)),
            drop_after_frames: None,
        }
    }
}

impl PeerConfig {
    /// Listen on an ephemeral loopback port
    pub fn loopback() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
            ..Self::default()
        }
    }

    /// Drop connections abnormally after `frames` frames
    pub fn with_drop_after_frames(mut self, frames: u64) -> Self {
        self.drop_after_frames = Some(frames);
        self
    }

    /// Change the idle ping interval (`None` disables it)
    pub fn with_idle_ping(mut self, idle_ping: Option<Duration>) -> Self {
        self.idle_ping = idle_ping;
        self
    }
}

/// Details about one connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Connection ID
    pub id: String,
    /// Remote address
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
}

/// Counters across every connection the peer has served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    /// WebSocket handshakes completed
    pub connections_accepted: u64,
    /// Frames decoded and analysed
    pub frames_analysed: u64,
    /// Frames that could not be decoded
    pub frames_rejected: u64,
    /// `ping` messages answered
    pub pings_answered: u64,
    /// Connections dropped on purpose without a close handshake
    pub connections_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections_accepted: AtomicU64,
    frames_analysed: AtomicU64,
    frames_rejected: AtomicU64,
    pings_answered: AtomicU64,
    connections_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PeerStats {
        PeerStats {
            connections_accepted: self.connections_accepted.load(Ordering::SeqCst),
            frames_analysed: self.frames_analysed.load(Ordering::SeqCst),
            frames_rejected: self.frames_rejected.load(Ordering::SeqCst),
            pings_answered: self.pings_answered.load(Ordering::SeqCst),
            connections_dropped: self.connections_dropped.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
struct PeerState {
    config: PeerConfig,
    clients: DashMap<String, ClientInfo>,
    tasks: DashMap<String, AbortHandle>,
    counters: Counters,
}

type ClientSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// WebSocket analysis peer
///
/// Accepts capture clients on any path, answers each frame with an
/// `analysis` message describing it, and answers `ping` with `pong`.
#[derive(Debug)]
pub struct AnalysisPeer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<PeerState>,
}

impl AnalysisPeer {
    /// Bind the listening socket
    pub async fn bind(config: PeerConfig) -> FramelinkResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            FramelinkError::ServerStartFailed {
                address: config.bind_addr,
                source: e,
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| FramelinkError::ServerStartFailed {
                address: config.bind_addr,
                source: e,
            })?;

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(PeerState {
                config,
                clients: DashMap::new(),
                tasks: DashMap::new(),
                counters: Counters::default(),
            }),
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients should connect to
    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Serve until the task is cancelled
    pub async fn run(self) {
        tracing::info!("Analysis peer listening on {}", self.local_addr);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("New connection from {}", addr);
                    spawn_connection(self.state.clone(), stream, addr);
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Serve in the background
    pub fn spawn(self) -> PeerHandle {
        let local_addr = self.local_addr;
        let state = self.state.clone();
        let accept_task = tokio::spawn(self.run());
        PeerHandle {
            local_addr,
            state,
            accept_task,
        }
    }
}

/// A peer running in the background; dropping it shuts the peer down
#[derive(Debug)]
pub struct PeerHandle {
    local_addr: SocketAddr,
    state: Arc<PeerState>,
    accept_task: JoinHandle<()>,
}

impl PeerHandle {
    /// Address the peer is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients should connect to
    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Counters so far
    pub fn stats(&self) -> PeerStats {
        self.state.counters.snapshot()
    }

    /// Clients currently connected
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.state.clients.iter().map(|c| c.value().clone()).collect()
    }

    /// Stop accepting and drop every open connection
    pub fn shutdown(&self) {
        self.accept_task.abort();
        for task in self.state.tasks.iter() {
            task.value().abort();
        }
        self.state.tasks.clear();
        self.state.clients.clear();
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_connection(state: Arc<PeerState>, stream: TcpStream, addr: SocketAddr) {
    let connection_id = Uuid::new_v4().to_string();
    let task_state = state.clone();
    let task_id = connection_id.clone();

    let task = tokio::spawn(async move {
        if let Err(e) = handle_connection(&task_state, &task_id, stream, addr).await {
            tracing::warn!("Connection {} error: {}", task_id, e);
        }
        task_state.clients.remove(&task_id);
        task_state.tasks.remove(&task_id);
    });

    // A very short connection may already have finished and cleaned up
    if !task.is_finished() {
        state.tasks.insert(connection_id, task.abort_handle());
    }
}

async fn handle_connection(
    state: &PeerState,
    connection_id: &str,
    stream: TcpStream,
    addr: SocketAddr,
) -> FramelinkResult<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| FramelinkError::Connection {
            endpoint: addr.to_string(),
            reason: format!("WebSocket handshake failed: {}", e),
        })?;

    state.counters.connections_accepted.fetch_add(1, Ordering::SeqCst);
    state.clients.insert(
        connection_id.to_string(),
        ClientInfo {
            id: connection_id.to_string(),
            addr,
            connected_at: Utc::now(),
        },
    );
    tracing::info!("Client {} connected from {}", connection_id, addr);

    let (mut sink, mut source) = ws_stream.split();
    let mut session = ClientSession::new();

    send(
        &mut sink,
        InboundMessage::Status {
            message: "Connected to analysis peer".to_string(),
        },
    )
    .await?;

    loop {
        let next = match state.config.idle_ping {
            Some(idle) => match tokio::time::timeout(idle, source.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::debug!("Client {} idle, sending ping", connection_id);
                    send(&mut sink, InboundMessage::Ping).await?;
                    continue;
                }
            },
            None => source.next().await,
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => {
                tracing::debug!("Connection {} closed", connection_id);
                break;
            }
            Some(Err(e)) => {
                tracing::warn!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
            None => {
                tracing::debug!("Connection {} stream ended", connection_id);
                break;
            }
            Some(Ok(_)) => continue,
        };

        match OutboundMessage::parse(&text) {
            Ok(OutboundMessage::Frame { data_url }) => {
                let reply = session.analyse(&data_url);
                match &reply {
                    InboundMessage::Analysis(_) => {
                        state.counters.frames_analysed.fetch_add(1, Ordering::SeqCst)
                    }
                    _ => state.counters.frames_rejected.fetch_add(1, Ordering::SeqCst),
                };
                send(&mut sink, reply).await?;

                if state
                    .config
                    .drop_after_frames
                    .is_some_and(|limit| session.frame_count >= limit)
                {
                    tracing::info!(
                        "Dropping connection {} after {} frames",
                        connection_id,
                        session.frame_count
                    );
                    state.counters.connections_dropped.fetch_add(1, Ordering::SeqCst);
                    // Returning drops the socket without a close frame
                    return Ok(());
                }
            }
            Ok(OutboundMessage::Ping) => {
                send(&mut sink, InboundMessage::Pong).await?;
                state.counters.pings_answered.fetch_add(1, Ordering::SeqCst);
            }
            Ok(OutboundMessage::Pong) => {}
            Ok(OutboundMessage::Close) => {
                tracing::debug!("Client {} asked to close", connection_id);
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client requested close".into(),
                    })))
                    .await;
                break;
            }
            Err(e) => {
                tracing::warn!("Invalid message on {}: {}", connection_id, e);
                send(
                    &mut sink,
                    InboundMessage::Error {
                        message: e.to_string(),
                    },
                )
                .await?;
            }
        }
    }

    tracing::info!(
        "Client {} disconnected after {} frames in {:.1}s",
        connection_id,
        session.frame_count,
        session.started.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn send(sink: &mut ClientSink, message: InboundMessage) -> FramelinkResult<()> {
    sink.send(Message::Text(message.to_text()))
        .await
        .map_err(|e| FramelinkError::Transmission {
            reason: e.to_string(),
        })
}

/// Per-connection frame accounting
struct ClientSession {
    started: Instant,
    frame_count: u64,
}

impl ClientSession {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            frame_count: 0,
        }
    }

    fn analyse(&mut self, data_url: &str) -> InboundMessage {
        self.frame_count += 1;
        let received = Instant::now();

        let decoded = match decode_data_url(data_url) {
            Ok(decoded) => decoded,
            Err(e) => {
                return InboundMessage::Error {
                    message: format!("Frame #{} could not be decoded: {}", self.frame_count, e),
                }
            }
        };

        let session_duration = received.duration_since(self.started);
        let elapsed = session_duration.as_secs_f64();
        let fps_average = if elapsed > 0.0 {
            self.frame_count as f64 / elapsed
        } else {
            0.0
        };

        let mut payload = AnalysisPayload::new(self.frame_count);
        payload.message = Some(format!(
            "Frame #{} received: {}",
            self.frame_count, decoded.resolution
        ));
        payload.description = Some(format!(
            "{} image, mean brightness {:.1}",
            decoded.resolution, decoded.mean_brightness
        ));
        payload.session_duration = Some(session_duration);
        payload.fps_average = Some(fps_average);
        payload.processing_time = Some(received.elapsed());
        payload.timestamp = Some(Utc::now().to_rfc3339());

        InboundMessage::Analysis(payload)
    }
}
