//! Realtime change listener.
//!
//! A [`RealtimeConnection`] owns one websocket to `/realtime`. Every subscription made on
//! it is returned to the caller as a [`Subscription`] handle; nothing is registered
//! globally and nothing is torn down implicitly. Handlers run on the connection's reader
//! task, one call per delivered event, in arrival order.
//!
//! The server may drop frames for a slow connection; it then sends an error frame and
//! callers should re-fetch. When the socket itself goes away, [`RealtimeConnection::closed`]
//! resolves and every subscription on it is dead.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::{MissionId, UserId},
    error::ApiError,
    protocol::{ChangeEvent, RealtimeMessage, RealtimeRequest, RowFilter, SubscriptionId, Topic},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};

type Handler = Box<dyn Fn(ChangeEvent) + Send + Sync>;
type Ack = oneshot::Sender<Result<(), ApiError>>;

struct Slot {
    handler: Mutex<Option<Handler>>,
}

impl Slot {
    /// Removes the handler, waiting for a callback in flight to return first.
    fn clear(&self) {
        lock(&self.handler).take();
    }
}

struct Shared {
    handlers: Mutex<HashMap<SubscriptionId, Arc<Slot>>>,
    pending: Mutex<HashMap<SubscriptionId, Ack>>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            handlers: Mutex::default(),
            pending: Mutex::default(),
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn forget(&self, id: SubscriptionId) {
        if let Some(slot) = lock(&self.handlers).remove(&id) {
            slot.clear();
        }
        lock(&self.pending).remove(&id);
    }

    fn dispatch(&self, frame: RealtimeMessage) {
        match frame {
            RealtimeMessage::Subscribed { subscription_id } => {
                if let Some(ack) = lock(&self.pending).remove(&subscription_id) {
                    let _ = ack.send(Ok(()));
                }
            }
            RealtimeMessage::SubscriptionError {
                subscription_id,
                error,
            } => match lock(&self.pending).remove(&subscription_id) {
                Some(ack) => {
                    let _ = ack.send(Err(error));
                }
                None => warn!(subscription_id = subscription_id.0, %error, "subscription error"),
            },
            RealtimeMessage::Change {
                subscription_id,
                event,
            } => {
                let slot = lock(&self.handlers).get(&subscription_id).cloned();
                let Some(slot) = slot else {
                    debug!(subscription_id = subscription_id.0, "change for a closed subscription");
                    return;
                };
                let handler = lock(&slot.handler);
                if let Some(handler) = handler.as_ref() {
                    handler(event);
                }
            }
            RealtimeMessage::Unsubscribed { subscription_id } => {
                debug!(subscription_id = subscription_id.0, "unsubscribed");
            }
            RealtimeMessage::Error(error) => warn!(%error, "realtime channel error"),
        }
    }
}

enum Outgoing {
    Request(RealtimeRequest),
    Close,
}

pub struct RealtimeClient;

impl RealtimeClient {
    pub async fn connect(server_url: &str, access_token: &str) -> ClientResult<RealtimeConnection> {
        let ws_url = realtime_url(server_url, access_token)?;
        let (stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| ClientError::Realtime(format!("failed to connect websocket: {err}")))?;
        let (mut sink, mut source) = stream.split();
        let shared = Arc::new(Shared::new());
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Outgoing>();

        let writer = tokio::spawn(async move {
            while let Some(item) = queue.recv().await {
                let text = match item {
                    Outgoing::Request(request) => match serde_json::to_string(&request) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode realtime request");
                            continue;
                        }
                    },
                    Outgoing::Close => break,
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!(error = %err, "realtime send failed");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeMessage>(&text) {
                        Ok(message) => reader_shared.dispatch(message),
                        Err(err) => warn!(error = %err, "unreadable realtime frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "realtime connection failed");
                        break;
                    }
                }
            }
            // Waiters on an ack learn the connection is gone.
            reader_shared.closed.send_replace(true);
            lock(&reader_shared.pending).clear();
            debug!("realtime reader stopped");
        });

        info!(url = %redacted(&ws_url), "realtime connected");
        Ok(RealtimeConnection {
            shared,
            outgoing,
            writer,
            reader,
        })
    }
}

pub struct RealtimeConnection {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RealtimeConnection {
    /// Registers `handler` for changes on `topic` and waits for the server to acknowledge.
    ///
    /// A handler must not unsubscribe its own subscription from inside the callback.
    pub async fn subscribe<F>(
        &self,
        topic: Topic,
        filter: Option<RowFilter>,
        handler: F,
    ) -> ClientResult<Subscription>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        if let Some(filter) = &filter {
            topic
                .validate_filter(filter)
                .map_err(|err| ClientError::Validation(err.message))?;
        }
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Box::new(handler);
        let slot = Arc::new(Slot {
            handler: Mutex::new(Some(handler)),
        });
        let (ack, acknowledged) = oneshot::channel();
        lock(&self.shared.handlers).insert(id, Arc::clone(&slot));
        lock(&self.shared.pending).insert(id, ack);

        let request = RealtimeRequest::Subscribe {
            subscription_id: id,
            topic,
            filter,
        };
        if self.shared.is_closed() || self.outgoing.send(Outgoing::Request(request)).is_err()
        {
            self.shared.forget(id);
            return Err(ClientError::Realtime("realtime connection is closed".into()));
        }

        match acknowledged.await {
            Ok(Ok(())) => {
                debug!(subscription_id = id.0, ?topic, "subscribed");
                Ok(Subscription {
                    id,
                    topic,
                    slot,
                    shared: Arc::clone(&self.shared),
                    outgoing: self.outgoing.clone(),
                })
            }
            Ok(Err(error)) => {
                self.shared.forget(id);
                Err(ClientError::Remote(error))
            }
            Err(_) => {
                self.shared.forget(id);
                Err(ClientError::Realtime(
                    "connection closed before the subscription was acknowledged".into(),
                ))
            }
        }
    }

    pub async fn subscribe_missions<F>(&self, handler: F) -> ClientResult<Subscription>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(Topic::Missions, None, handler).await
    }

    /// Offers addressed to one recipient.
    pub async fn subscribe_offers_for<F>(
        &self,
        recipient: UserId,
        handler: F,
    ) -> ClientResult<Subscription>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            Topic::MissionOffers,
            Some(RowFilter::column_eq("recipient_id", recipient)),
            handler,
        )
        .await
    }

    pub async fn subscribe_notifications<F>(
        &self,
        user: UserId,
        handler: F,
    ) -> ClientResult<Subscription>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            Topic::Notifications,
            Some(RowFilter::column_eq("recipient_id", user)),
            handler,
        )
        .await
    }

    pub async fn subscribe_chat<F>(&self, mission: MissionId, handler: F) -> ClientResult<Subscription>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            Topic::ChatMessages,
            Some(RowFilter::column_eq("mission_id", mission)),
            handler,
        )
        .await
    }

    pub async fn subscribe_status_transitions<F>(
        &self,
        mission: MissionId,
        handler: F,
    ) -> ClientResult<Subscription>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            Topic::StatusTransitions,
            Some(RowFilter::column_eq("mission_id", mission)),
            handler,
        )
        .await
    }

    /// True once the socket is gone, whether the server hung up or [`Self::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves when the socket is gone. Handlers get no further events after that;
    /// reconnect, re-subscribe and re-fetch current state.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        // The sender lives in `self.shared`, so the wait cannot fail.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Drops every handler this connection owns and closes the socket.
    pub async fn close(self) {
        let slots: Vec<Arc<Slot>> = lock(&self.shared.handlers)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            slot.clear();
        }
        let _ = self.outgoing.send(Outgoing::Close);
        if let Err(err) = self.writer.await {
            warn!(error = %err, "realtime writer task failed");
        }
        self.reader.abort();
        self.shared.closed.send_replace(true);
        info!("realtime connection closed");
    }
}

/// Caller-owned handle to one subscription. Dropping it leaves the subscription active;
/// call [`Subscription::unsubscribe`] to stop deliveries.
#[must_use = "a subscription stays active until unsubscribe() is called"]
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    slot: Arc<Slot>,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// The handler gets no calls once this returns.
    pub fn unsubscribe(self) {
        self.slot.clear();
        lock(&self.shared.handlers).remove(&self.id);
        let request = RealtimeRequest::Unsubscribe {
            subscription_id: self.id,
        };
        if self.outgoing.send(Outgoing::Request(request)).is_err() {
            debug!(subscription_id = self.id.0, "connection already closed");
        }
    }
}

fn realtime_url(server_url: &str, access_token: &str) -> ClientResult<Url> {
    let base = server_url.trim_end_matches('/');
    let ws_base = if base.starts_with("https://") {
        base.replacen("https://", "wss://", 1)
    } else if base.starts_with("http://") {
        base.replacen("http://", "ws://", 1)
    } else {
        return Err(ClientError::Validation(
            "server_url must start with http:// or https://".into(),
        ));
    };
    let mut url = Url::parse(&format!("{ws_base}/realtime"))
        .map_err(|err| ClientError::Validation(format!("invalid server_url: {err}")))?;
    url.query_pairs_mut().append_pair("access_token", access_token);
    Ok(url)
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
