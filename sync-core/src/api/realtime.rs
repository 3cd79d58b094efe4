use super::error::*;
use crate::events::MediaEvent;
use backoff::{future::retry, ExponentialBackoff};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot},
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReceiver = SplitStream<WsStream>;

pub struct RealtimeSubscription {
    pub receiver: broadcast::Receiver<MediaEvent>,
}

impl RealtimeSubscription {
    pub async fn next(&mut self) -> Option<MediaEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Realtime subscription lagged, some events were missed");
                    continue;
                }
            }
        }
    }
}

/// Push channel client that keeps a websocket open to the daemon and
/// reconnects with exponential backoff when it drops.
///
/// The daemon keeps no replay buffer, so callers should re-fetch current
/// state after every reconnect.
pub struct RealtimeClient {
    ws_url: Url,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU64>,
    sender: broadcast::Sender<MediaEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RealtimeClient {
    /// Build a client for the daemon at `base_url` (http or https)
    pub fn new(base_url: &Url) -> Result<Self> {
        let ws_url = websocket_url(base_url)?;
        let (sender, _) = broadcast::channel(256);

        Ok(Self {
            ws_url,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
            sender,
            shutdown: None,
            task_handle: None,
        })
    }

    pub fn ws_url(&self) -> &Url {
        &self.ws_url
    }

    pub fn subscribe(&self) -> RealtimeSubscription {
        RealtimeSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Start the background connection task
    pub fn connect(&mut self) {
        if self.task_handle.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);

        let ws_url = self.ws_url.clone();
        let connected = self.connected.clone();
        let reconnect_attempts = self.reconnect_attempts.clone();
        let sender = self.sender.clone();

        self.task_handle = Some(tokio::spawn(async move {
            Self::connection_loop(ws_url, connected, reconnect_attempts, sender, shutdown_rx).await;
        }));
    }

    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }

        self.connected.store(false, Ordering::Relaxed);
    }

    async fn connection_loop(
        ws_url: Url,
        connected: Arc<AtomicBool>,
        reconnect_attempts: Arc<AtomicU64>,
        sender: broadcast::Sender<MediaEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            let policy = ExponentialBackoff {
                initial_interval: Duration::from_millis(500),
                max_interval: Duration::from_secs(30),
                max_elapsed_time: None,
                ..Default::default()
            };

            let url = &ws_url;
            let attempts_counter = &reconnect_attempts;
            let connect = retry(policy, move || async move {
                Self::establish_connection(url).await.map_err(|e| {
                    let attempts = attempts_counter.fetch_add(1, Ordering::Relaxed);
                    warn!(attempt = attempts + 1, error = %e, "Failed to connect to push channel");
                    backoff::Error::transient(e)
                })
            });

            let (mut sink, mut receiver) = tokio::select! {
                result = connect => match result {
                    Ok(streams) => streams,
                    Err(e) => {
                        error!("Giving up on push channel: {}", e);
                        break;
                    }
                },
                _ = &mut shutdown_rx => break,
            };

            info!(url = %ws_url, "Push channel connected");
            connected.store(true, Ordering::Relaxed);
            reconnect_attempts.store(0, Ordering::Relaxed);

            let shutdown = loop {
                tokio::select! {
                    msg = receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => Self::handle_message(&text, &sender),
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = sink.send(Message::Pong(payload)).await {
                                warn!("Failed to answer ping: {}", e);
                                break false;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Push channel closed by daemon");
                            break false;
                        }
                        Some(Err(e)) => {
                            error!("Push channel error: {}", e);
                            break false;
                        }
                        Some(Ok(_)) => {}
                    },
                    _ = &mut shutdown_rx => break true,
                }
            };

            connected.store(false, Ordering::Relaxed);
            if shutdown {
                let _ = sink.close().await;
                break;
            }
        }

        connected.store(false, Ordering::Relaxed);
    }

    async fn establish_connection(ws_url: &Url) -> Result<(WsSink, WsReceiver)> {
        debug!("Connecting to WebSocket: {}", ws_url);

        let (ws_stream, _) = timeout(Duration::from_secs(10), connect_async(ws_url.as_str()))
            .await
            .map_err(|_| ClientError::WebSocket("Connection timeout".to_string()))?
            .map_err(|e| ClientError::WebSocket(format!("Connection failed: {}", e)))?;

        Ok(ws_stream.split())
    }

    fn handle_message(text: &str, sender: &broadcast::Sender<MediaEvent>) {
        match serde_json::from_str::<MediaEvent>(text) {
            Ok(event) => {
                // No subscribers is fine; the event is simply dropped
                let _ = sender.send(event);
            }
            Err(e) => warn!("Ignoring unrecognised push message: {}", e),
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Map the daemon base URL onto its websocket endpoint
pub fn websocket_url(base_url: &Url) -> Result<Url> {
    let mut url = base_url.join("ws")?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::WebSocket(format!("Cannot use {} for a websocket", base_url)))?;
    Ok(url)
}
