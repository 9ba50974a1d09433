//! Live sync events over `GET /ws`.
//!
//! Every event is serialized once by [`BroadcastObserver`] and fanned out as
//! an [`EventFrame`]. A client may narrow its stream with `?run_id=` and/or
//! `?target=`.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::api::SharedState;
use crate::sync::{SyncObserver, SyncOutcome, SyncProgress, SyncStatus};

/// A quiet client gets a Ping after this long.
const PING_AFTER: Duration = Duration::from_secs(20);

/// A client that has sent nothing, not even a Pong, for this long is dropped.
const IDLE_LIMIT: Duration = Duration::from_secs(60);

/// Outgoing messages buffered per client before the forwarder waits.
const OUTBOX: usize = 64;

pub type EventSender = broadcast::Sender<Arc<EventFrame>>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SyncEvent {
    RunStarted { run_id: i64, target: String },
    Progress { progress: SyncProgress },
    FileSynced { run_id: i64, file: String },
    RunCompleted { outcome: SyncOutcome },
    RunFailed { outcome: SyncOutcome },
    RunCancelled { outcome: SyncOutcome },
    /// Sent to one client whose buffer overflowed; poll progress to catch up.
    Lagged { skipped: u64 },
}

impl SyncEvent {
    pub fn finished(outcome: &SyncOutcome) -> Self {
        let outcome = outcome.clone();
        match outcome.status {
            SyncStatus::Completed => SyncEvent::RunCompleted { outcome },
            SyncStatus::Cancelled => SyncEvent::RunCancelled { outcome },
            _ => SyncEvent::RunFailed { outcome },
        }
    }
}

/// One serialized event with the fields subscriptions filter on.
#[derive(Debug)]
pub struct EventFrame {
    pub run_id: i64,
    pub target: Option<String>,
    pub json: String,
}

/// What a client asked to see. Empty means everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Subscription {
    pub run_id: Option<i64>,
    pub target: Option<String>,
}

impl Subscription {
    pub fn matches(&self, frame: &EventFrame) -> bool {
        let run_ok = self.run_id.is_none_or(|id| id == frame.run_id);
        let target_ok = match &self.target {
            Some(wanted) => frame.target.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        run_ok && target_ok
    }
}

/// Publishes sync updates to every connected WebSocket client.
///
/// Remembers the target of each started run so file and outcome events,
/// which carry only a run id, can still be filtered by target.
#[derive(Clone)]
pub struct BroadcastObserver {
    tx: EventSender,
    targets: Arc<Mutex<HashMap<i64, String>>>,
}

impl BroadcastObserver {
    pub fn new(tx: EventSender) -> Self {
        Self {
            tx,
            targets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn target_of(&self, run_id: i64) -> Option<String> {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
            .cloned()
    }

    fn publish(&self, run_id: i64, target: Option<String>, event: &SyncEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "failed to serialize sync event");
                return;
            }
        };
        // No subscribers is fine.
        let _ = self.tx.send(Arc::new(EventFrame {
            run_id,
            target,
            json,
        }));
    }
}

impl SyncObserver for BroadcastObserver {
    fn on_started(&self, run_id: i64, target: &str) {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, target.to_string());
        self.publish(
            run_id,
            Some(target.to_string()),
            &SyncEvent::RunStarted {
                run_id,
                target: target.to_string(),
            },
        );
    }

    fn on_progress(&self, progress: &SyncProgress) {
        self.publish(
            progress.run_id,
            Some(progress.target.clone()),
            &SyncEvent::Progress {
                progress: progress.clone(),
            },
        );
    }

    fn on_file(&self, run_id: i64, file: &str) {
        self.publish(
            run_id,
            self.target_of(run_id),
            &SyncEvent::FileSynced {
                run_id,
                file: file.to_string(),
            },
        );
    }

    fn on_finished(&self, outcome: &SyncOutcome) {
        let target = self
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&outcome.run_id);
        self.publish(outcome.run_id, target, &SyncEvent::finished(outcome));
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(subscription): Query<Subscription>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let events = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| serve_client(socket, events, subscription))
}

/// One connected client: a writer task owns the socket sink, a forwarder
/// task feeds it matching events, and this task reads client frames and
/// keeps the connection alive.
async fn serve_client(
    socket: WebSocket,
    events: broadcast::Receiver<Arc<EventFrame>>,
    subscription: Subscription,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut outgoing) = mpsc::channel::<Message>(OUTBOX);

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });
    let forwarder = tokio::spawn(forward_events(events, subscription, outbox.clone()));

    let mut last_heard = Instant::now();
    loop {
        match tokio::time::timeout(PING_AFTER, stream.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
            Ok(Some(Ok(_))) => last_heard = Instant::now(),
            Err(_) => {
                if last_heard.elapsed() >= IDLE_LIMIT {
                    tracing::debug!("dropping silent websocket client");
                    break;
                }
                if outbox.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    forwarder.abort();
    let _ = outbox.send(Message::Close(None)).await;
    drop(outbox);
    let _ = writer.await;
}

async fn forward_events(
    mut events: broadcast::Receiver<Arc<EventFrame>>,
    subscription: Subscription,
    outbox: mpsc::Sender<Message>,
) {
    loop {
        let text = match events.recv().await {
            Ok(frame) if subscription.matches(&frame) => frame.json.clone(),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "websocket client lagged");
                match serde_json::to_string(&SyncEvent::Lagged { skipped }) {
                    Ok(json) => json,
                    Err(_) => continue,
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if outbox.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
}
