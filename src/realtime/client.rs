//! Client side of the realtime channel.
//!
//! The client opens a socket while a user is signed in, introduces itself
//! with the `auth` frame, and fans inbound frames out to handlers keyed by
//! message type. It never reconnects, queues or retries on its own.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

use super::handlers::{HandlerId, HandlerRegistry};
use super::message::Envelope;

pub type ClientHandler = dyn Fn(&Envelope) + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no signed-in user to authenticate as")]
    NoUser,
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Open,
}

/// Builds the socket address from the page's base URL: `https` pages get
/// `wss`, `http` pages get `ws`.
pub fn socket_url(base: &str, ws_path: &str) -> Result<Url, ClientError> {
    let invalid = |reason: String| ClientError::InvalidUrl {
        url: base.to_string(),
        reason,
    };

    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a websocket scheme".to_string()))?;
    url.set_path(ws_path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

struct Active {
    generation: u64,
    outbox: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
}

struct Inner {
    socket_url: Url,
    user_id: Mutex<Option<String>>,
    active: Mutex<Option<Active>>,
    connecting: AtomicBool,
    generation: AtomicU64,
    handlers: HandlerRegistry<ClientHandler>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user(&self) -> MutexGuard<'_, Option<String>> {
        self.user_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, text: &str) {
        let message = match Envelope::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding malformed realtime frame");
                return;
            }
        };
        for handler in self.handlers.handlers_for(&message.kind) {
            handler(&message);
        }
    }

    // Only clears state if `generation` is still the current connection.
    fn connection_lost(&self, generation: u64) {
        let mut active = self.active();
        if active.as_ref().map(|a| a.generation) == Some(generation) {
            *active = None;
            info!("realtime connection closed by server");
        }
    }
}

#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    pub fn new(base_url: &str, ws_path: &str) -> Result<Self, ClientError> {
        Ok(Self {
            inner: Arc::new(Inner {
                socket_url: socket_url(base_url, ws_path)?,
                user_id: Mutex::new(None),
                active: Mutex::new(None),
                connecting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                handlers: HandlerRegistry::new(),
            }),
        })
    }

    pub fn socket_url(&self) -> &Url {
        &self.inner.socket_url
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.user().clone()
    }

    pub fn state(&self) -> ClientState {
        if self.inner.active().is_some() {
            ClientState::Open
        } else if self.inner.connecting.load(Ordering::SeqCst) {
            ClientState::Connecting
        } else {
            ClientState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Open
    }

    /// Follows the sign-in state: a user opens a connection, `None` closes it
    /// and forgets the user.
    pub async fn set_user(&self, user_id: Option<String>) -> Result<(), ClientError> {
        match user_id {
            Some(user_id) => {
                let unchanged = self.inner.user().replace(user_id.clone()) == Some(user_id);
                if unchanged && self.is_connected() {
                    return Ok(());
                }
                self.connect().await
            }
            None => {
                self.inner.user().take();
                self.disconnect();
                Ok(())
            }
        }
    }

    /// Opens the socket and sends the `auth` handshake. Any previous
    /// connection is closed first.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let user_id = self.user_id().ok_or(ClientError::NoUser)?;
        let handshake = Envelope::auth(user_id.clone()).to_text()?;
        self.disconnect();

        self.inner.connecting.store(true, Ordering::SeqCst);
        let result = connect_async(self.inner.socket_url.as_str()).await;
        self.inner.connecting.store(false, Ordering::SeqCst);

        let (stream, _) = result.map_err(|e| {
            warn!(url = %self.inner.socket_url, error = %e, "realtime connection failed");
            e
        })?;

        if self.user_id().as_deref() != Some(user_id.as_str()) {
            debug!("user changed while connecting, dropping socket");
            return Ok(());
        }

        let (mut sink, mut source) = stream.split();
        let (outbox, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        // first frame on the wire
        let _ = outbox.send(WsMessage::text(handshake));

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "realtime write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut active = self.inner.active();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match weak.upgrade() {
                        Some(inner) => inner.dispatch(text.as_str()),
                        None => break,
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "realtime connection error");
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(generation);
            }
        });
        *active = Some(Active {
            generation,
            outbox,
            reader,
        });

        info!(url = %self.inner.socket_url, user = %user_id, "realtime connection open");
        Ok(())
    }

    /// Closes the current connection, if any. Frames not yet written may be lost.
    pub fn disconnect(&self) {
        let previous = self.inner.active().take();
        if let Some(active) = previous {
            // dropping the outbox lets the writer send a close frame
            active.reader.abort();
            info!("realtime connection closed");
        }
    }

    /// Subscribes `handler` to frames of type `kind`. Handlers for one type
    /// run in the order they were added.
    pub fn add_message_handler<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.inner.handlers.add(kind, Arc::new(handler));
        Subscription {
            client: Arc::downgrade(&self.inner),
            kind: kind.to_string(),
            id,
        }
    }

    /// Writes `message` if the connection is open. Returns false otherwise;
    /// nothing is queued for later.
    pub fn send_message(&self, message: &Envelope) -> bool {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %message.kind, error = %e, "failed to encode realtime message");
                return false;
            }
        };
        match self.inner.active().as_ref() {
            Some(active) => active.outbox.send(WsMessage::text(text)).is_ok(),
            None => {
                debug!(kind = %message.kind, "not connected, message dropped");
                false
            }
        }
    }
}

/// Disposer returned by [`RealtimeClient::add_message_handler`]. Dropping it
/// leaves the handler registered; only [`Subscription::unsubscribe`] removes it.
#[must_use = "dropping the subscription keeps the handler; call unsubscribe() to remove it"]
pub struct Subscription {
    client: Weak<Inner>,
    kind: String,
    id: HandlerId,
}

impl Subscription {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Removes this handler and no other.
    pub fn unsubscribe(self) -> bool {
        match self.client.upgrade() {
            Some(inner) => inner.handlers.remove(&self.kind, self.id),
            None => false,
        }
    }
}
