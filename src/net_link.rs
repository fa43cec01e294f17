use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::error::CallError;

/// Queue depth per direction. A live call produces ~50 frames/s.
pub const LINK_CAPACITY: usize = 256;

/// Upper bound on the assistant socket handshake (TCP + TLS + upgrade).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One duplex text-message connection, reduced to a pair of channels.
///
/// `rx` yields `None` once the remote side is gone. Dropping every clone of
/// `tx` flushes what is queued and then closes the connection.
pub struct PeerLink {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

impl PeerLink {
    /// Two links wired back to back; used for in-process peers and tests.
    pub fn pair(capacity: usize) -> (PeerLink, PeerLink) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            PeerLink { tx: a_tx, rx: a_rx },
            PeerLink { tx: b_tx, rx: b_rx },
        )
    }
}

/// What a [`PeerLink`] needs to know about one socket message.
pub enum Frame {
    Text(String),
    Close,
    /// Ping/pong and binary frames. Neither peer protocol uses them.
    Other,
}

/// Message types of the socket libraries that can back a [`PeerLink`].
pub trait TextMessage: Send + Unpin + 'static {
    fn from_text(text: String) -> Self;
    fn into_frame(self) -> Frame;
}

impl TextMessage for Message {
    fn from_text(text: String) -> Self {
        Message::Text(text.into())
    }

    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::Text(text.to_string()),
            Message::Close(_) => Frame::Close,
            _ => Frame::Other,
        }
    }
}

impl TextMessage for axum::extract::ws::Message {
    fn from_text(text: String) -> Self {
        axum::extract::ws::Message::Text(text)
    }

    fn into_frame(self) -> Frame {
        match self {
            axum::extract::ws::Message::Text(text) => Frame::Text(text),
            axum::extract::ws::Message::Close(_) => Frame::Close,
            _ => Frame::Other,
        }
    }
}

/// Splits a socket into a reader task and a writer task bridged to a
/// [`PeerLink`].
///
/// The reader stops when the remote closes or the link's `rx` is dropped.
/// The writer drains what is queued, then closes the socket once every `tx`
/// clone is gone.
pub fn link_socket<S, M, E>(socket: S, label: &str) -> PeerLink
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + 'static,
    <S as Sink<M>>::Error: fmt::Display + Send,
    M: TextMessage,
    E: fmt::Display + Send + 'static,
{
    let (mut write, mut read) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<String>(LINK_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CAPACITY);

    let reader_label = label.to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(msg)) => match msg.into_frame() {
                            Frame::Text(text) => text,
                            Frame::Close => {
                                log::info!("{} closed the connection", reader_label);
                                break;
                            }
                            Frame::Other => continue,
                        },
                        Some(Err(e)) => {
                            log::warn!("{} read error: {}", reader_label, e);
                            break;
                        }
                        None => break,
                    };
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                _ = in_tx.closed() => break,
            }
        }
    });

    let writer_label = label.to_string();
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = write.send(M::from_text(text)).await {
                log::warn!("{} write error: {}", writer_label, e);
                break;
            }
        }
        let _ = write.close().await;
        log::debug!("{} writer finished", writer_label);
    });

    PeerLink {
        tx: out_tx,
        rx: in_rx,
    }
}

/// Opens the assistant-side connection for one call.
#[async_trait]
pub trait AssistantConnector: Send + Sync {
    async fn connect(&self) -> Result<PeerLink, CallError>;
}

pub struct RealtimeConnector {
    url: String,
    api_key: String,
    connect_timeout: Duration,
}

impl RealtimeConnector {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn build_request(&self) -> anyhow::Result<Request<()>> {
        let url = Url::parse(&self.url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("realtime url has no host"))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("OpenAI-Beta", "realtime=v1");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        Ok(builder.body(())?)
    }
}

#[async_trait]
impl AssistantConnector for RealtimeConnector {
    async fn connect(&self) -> Result<PeerLink, CallError> {
        let request = self
            .build_request()
            .map_err(|e| CallError::InvalidConfiguration(e.to_string()))?;
        if self.api_key.is_empty() {
            log::warn!("OPENAI_API_KEY is not set; connecting without credentials");
        }

        log::info!("Connecting to realtime assistant at {}...", self.url);
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                CallError::PeerUnavailable(format!(
                    "{}: no handshake within {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| CallError::PeerUnavailable(format!("{}: {}", self.url, e)))?;
        log::info!("Realtime assistant connected");

        Ok(link_socket(ws_stream, "assistant"))
    }
}
