//! Live session lifecycle: admission, the per-session delivery actor, and
//! the registry of active sessions.
//!
//! A session moves Connecting → Active → Draining → Closed. While Active it
//! runs as one spawned task that selects over its cancellation token, the
//! transport, pushed room events, and a cycle timer. Every cycle polls for
//! new messages; presence, typing, heartbeats and presence refreshes run on
//! slower multiples of the cycle.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use duet_core::{
    now_millis, Message, PresenceSnapshot, PresenceStatus, RoomId, SessionId, StreamEvent, UserId,
};
use duet_settings::DeliverySettings;
use duet_telemetry::metrics::{
    ADMISSION_REJECTIONS_TOTAL, LIVE_SESSIONS_ACTIVE, LIVE_SESSIONS_OPENED_TOTAL,
    MESSAGES_DELIVERED_TOTAL, SESSION_CYCLE_DURATION_SECONDS,
};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use super::admission::{Admission, AdmissionConfig, AdmissionError, AdmissionPermit};
use super::connection::{LiveConnection, TransportClosed};
use crate::broadcast::{Callback, RoomEvent, SubscriberError, SubscriptionHandle};
use crate::service::ChatService;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub cycle_interval: Duration,
    pub presence_every: u32,
    pub typing_every: u32,
    pub heartbeat_every: u32,
    pub presence_refresh_every: u32,
    /// Capacity of the outbound stream and of the push channel.
    pub buffer: usize,
}

impl SessionConfig {
    pub fn from_settings(delivery: &DeliverySettings) -> Self {
        Self {
            cycle_interval: delivery.cycle_interval(),
            presence_every: delivery.presence_every,
            typing_every: delivery.typing_every,
            heartbeat_every: delivery.heartbeat_every,
            presence_refresh_every: delivery.presence_refresh_every,
            buffer: delivery.push_buffer,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_millis(500),
            presence_every: 4,
            typing_every: 2,
            heartbeat_every: 20,
            presence_refresh_every: 60,
            buffer: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

/// A point-in-time view of one registered session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub identity: UserId,
    pub room: RoomId,
    pub state: SessionState,
    pub connected_secs: u64,
    pub dropped_events: u64,
}

struct SessionEntry {
    connection: Arc<LiveConnection>,
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
}

/// An accepted session: its id and the event stream to hand to the transport.
#[derive(Debug)]
pub struct OpenedSession {
    pub session_id: SessionId,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Owns every live session in the process.
pub struct ConnectionManager {
    service: Arc<ChatService>,
    admission: Arc<Admission>,
    config: SessionConfig,
    sessions: DashMap<SessionId, SessionEntry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Sessions cancel when `shutdown` does.
    pub fn new(
        service: Arc<ChatService>,
        admission: AdmissionConfig,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            admission: Admission::new(admission),
            config,
            sessions: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn service(&self) -> &Arc<ChatService> {
        &self.service
    }

    /// Admit and start a session for `identity` in `room`, delivering
    /// messages newer than `since`.
    ///
    /// The caller must already have checked that `identity` participates in
    /// `room`.
    #[instrument(skip_all, fields(%room, %identity))]
    pub fn open(
        self: &Arc<Self>,
        room: RoomId,
        identity: UserId,
        since: i64,
    ) -> Result<OpenedSession, AdmissionError> {
        let permit = self.admission.try_admit(&identity).inspect_err(|e| {
            counter!(ADMISSION_REJECTIONS_TOTAL, "reason" => e.reason()).increment(1);
            info!(
                reason = e.reason(),
                retry_after_ms = e.retry_after().as_millis() as u64,
                "session rejected"
            );
        })?;

        let session_id = SessionId::new();
        let (tx, events) = mpsc::channel(self.config.buffer.max(1));
        let connection = Arc::new(LiveConnection::new(
            session_id.clone(),
            identity.clone(),
            room.clone(),
            tx,
        ));

        let (push_tx, push_rx) = mpsc::channel::<RoomEvent>(self.config.buffer.max(1));
        let callback: Callback = Arc::new(move |event: &RoomEvent| -> Result<(), SubscriberError> {
            match push_tx.try_send(event.clone()) {
                // A full push queue is caught up by the next poll.
                Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
                Err(TrySendError::Closed(_)) => Err(SubscriberError::Closed),
            }
        });
        let subscription = self
            .service
            .broadcaster()
            .subscribe(&room, &identity, callback);

        let state = Arc::new(Mutex::new(SessionState::Connecting));
        let cancel = self.shutdown.child_token();
        let _ = self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                connection: Arc::clone(&connection),
                state: Arc::clone(&state),
                cancel: cancel.clone(),
            },
        );
        counter!(LIVE_SESSIONS_OPENED_TOTAL).increment(1);
        gauge!(LIVE_SESSIONS_ACTIVE).increment(1.0);

        let peer = self.service.rooms().peer_of(&room, &identity);
        let actor = SessionActor {
            manager: Arc::clone(self),
            connection,
            state,
            cancel,
            subscription,
            permit: Some(permit),
            push_rx,
            peer,
            watermark: since,
            last_presence: None,
            peer_typing: false,
        };
        let span = info_span!("live_session", session = %session_id, user = %identity, room = %room);
        let handle = tokio::spawn(actor.run().instrument(span));
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);

        debug!(%session_id, "session opened");
        Ok(OpenedSession { session_id, events })
    }

    /// Ask a session to drain. Returns `false` for an unknown id.
    pub fn close(&self, session_id: &SessionId) -> bool {
        let Some(entry) = self.sessions.get(session_id) else {
            return false;
        };
        entry.cancel.cancel();
        true
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let conn = &entry.connection;
                SessionInfo {
                    session_id: entry.key().clone(),
                    identity: conn.identity.clone(),
                    room: conn.room.clone(),
                    state: *entry.state.lock(),
                    connected_secs: conn.age().as_secs(),
                    dropped_events: conn.drop_count(),
                }
            })
            .collect()
    }

    pub fn sessions_for(&self, identity: &UserId) -> Vec<SessionInfo> {
        self.active_sessions()
            .into_iter()
            .filter(|s| &s.identity == identity)
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether `identity` has any registered session in `room`.
    fn has_session(&self, identity: &UserId, room: &RoomId) -> bool {
        self.sessions
            .iter()
            .any(|e| &e.connection.identity == identity && &e.connection.room == room)
    }

    fn deregister(&self, session_id: &SessionId) {
        if self.sessions.remove(session_id).is_some() {
            gauge!(LIVE_SESSIONS_ACTIVE).decrement(1.0);
        }
    }

    /// Hand over the session task handles, for awaiting during shutdown.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }
}

struct SessionActor {
    manager: Arc<ConnectionManager>,
    connection: Arc<LiveConnection>,
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
    subscription: SubscriptionHandle,
    permit: Option<AdmissionPermit>,
    push_rx: mpsc::Receiver<RoomEvent>,
    peer: Option<UserId>,
    /// Newest message timestamp this session has examined.
    watermark: i64,
    last_presence: Option<PresenceSnapshot>,
    peer_typing: bool,
}

fn due(cycle: u64, every: u32) -> bool {
    cycle % u64::from(every.max(1)) == 0
}

impl SessionActor {
    fn service(&self) -> &ChatService {
        &self.manager.service
    }

    fn config(&self) -> &SessionConfig {
        &self.manager.config
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    async fn run(mut self) {
        self.set_state(SessionState::Active);
        info!(since = self.watermark, "live session active");
        if self.start().await.is_ok() {
            self.cycle_loop().await;
        }
        self.drain().await;
    }

    async fn start(&mut self) -> Result<(), TransportClosed> {
        let conn = Arc::clone(&self.connection);
        self.send(StreamEvent::Connected {
            session_id: conn.session_id.clone(),
            user: conn.identity.clone(),
            room: conn.room.clone(),
            server_time: now_millis(),
        })
        .await?;

        if let Err(e) = self
            .service()
            .set_presence(&conn.room, &conn.identity, PresenceStatus::Online)
            .await
        {
            warn!(error = %e, "failed to mark session online");
        }
        self.check_presence().await
    }

    async fn cycle_loop(&mut self) {
        let mut ticker = tokio::time::interval(self.config().cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycle: u64 = 0;
        let mut push_open = true;

        loop {
            if !self.connection.is_alive() {
                break;
            }
            let connection = Arc::clone(&self.connection);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!("session cancelled");
                    break;
                }
                () = connection.closed() => {
                    debug!("client went away");
                    break;
                }
                event = self.push_rx.recv(), if push_open => match event {
                    Some(event) => {
                        if self.on_push(event).await.is_err() {
                            break;
                        }
                    }
                    None => push_open = false,
                },
                _ = ticker.tick() => {
                    cycle += 1;
                    if self.on_cycle(cycle).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Deliver an event, waiting for room in the stream. Cancellation ends
    /// the wait as if the transport had closed.
    async fn send(&self, event: StreamEvent) -> Result<(), TransportClosed> {
        if !self.connection.is_alive() {
            return Err(TransportClosed);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TransportClosed),
            res = self.connection.deliver(event) => res,
        }
    }

    async fn on_cycle(&mut self, cycle: u64) -> Result<(), TransportClosed> {
        let started = std::time::Instant::now();
        self.poll_messages().await?;

        let config = self.config().clone();
        if due(cycle, config.presence_every) {
            self.check_presence().await?;
        }
        if due(cycle, config.typing_every) {
            self.check_typing().await?;
        }
        if due(cycle, config.heartbeat_every) {
            let _ = self.connection.offer(StreamEvent::Heartbeat {
                server_time: now_millis(),
            })?;
        }
        if due(cycle, config.presence_refresh_every) {
            let conn = &self.connection;
            if let Err(e) = self.service().touch_presence(&conn.room, &conn.identity).await {
                warn!(error = %e, "presence refresh failed");
            }
        }
        histogram!(SESSION_CYCLE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn poll_messages(&mut self) -> Result<(), TransportClosed> {
        let found = match self
            .service()
            .messages_since(&self.connection.room, self.watermark)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "message poll failed");
                return Ok(());
            }
        };
        self.deliver_batch(found).await
    }

    async fn on_push(&mut self, event: RoomEvent) -> Result<(), TransportClosed> {
        match event {
            RoomEvent::Message(message) => {
                if message.timestamp <= self.watermark {
                    return Ok(());
                }
                // Read the store directly so an earlier message published
                // after this one is not skipped.
                let found = match self
                    .service()
                    .store()
                    .query(&self.connection.room, self.watermark, usize::MAX)
                    .await
                {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(error = %e, "push fetch failed, waiting for poll");
                        return Ok(());
                    }
                };
                self.deliver_batch(found).await
            }
            RoomEvent::Presence(change) => {
                let mut users = match self.last_presence.take() {
                    Some(users) => users,
                    None => match self.service().presence(&self.connection.room).await {
                        Ok(users) => users,
                        Err(e) => {
                            warn!(error = %e, "presence fetch failed, waiting for next check");
                            return Ok(());
                        }
                    },
                };
                let _ = users.insert(change.user, change.record);
                self.last_presence = Some(users.clone());
                self.send(StreamEvent::Presence { users }).await
            }
        }
    }

    /// Deliver the messages above the watermark not sent by this session's
    /// identity, then advance the watermark past everything examined.
    async fn deliver_batch(&mut self, messages: Vec<Message>) -> Result<(), TransportClosed> {
        let Some(newest) = messages.iter().map(|m| m.timestamp).max() else {
            return Ok(());
        };
        let watermark = self.watermark;
        let identity = &self.connection.identity;
        let fresh: Vec<Message> = messages
            .into_iter()
            .filter(|m| m.timestamp > watermark && !m.is_from(identity))
            .collect();
        if !fresh.is_empty() {
            let count = fresh.len();
            self.send(StreamEvent::Messages { messages: fresh }).await?;
            counter!(MESSAGES_DELIVERED_TOTAL).increment(count as u64);
            debug!(count, "messages delivered");
        }
        self.watermark = self.watermark.max(newest);
        Ok(())
    }

    async fn check_presence(&mut self) -> Result<(), TransportClosed> {
        let users = match self.service().presence(&self.connection.room).await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "presence check failed");
                return Ok(());
            }
        };
        if self.last_presence.as_ref() == Some(&users) {
            return Ok(());
        }
        self.last_presence = Some(users.clone());
        self.send(StreamEvent::Presence { users }).await
    }

    async fn check_typing(&mut self) -> Result<(), TransportClosed> {
        let Some(peer) = self.peer.clone() else {
            return Ok(());
        };
        let conn = Arc::clone(&self.connection);
        let is_typing = match self
            .service()
            .is_typing(&conn.room, &peer, &conn.identity)
            .await
        {
            Ok(is_typing) => is_typing,
            Err(e) => {
                warn!(error = %e, "typing check failed");
                return Ok(());
            }
        };
        if is_typing == self.peer_typing {
            return Ok(());
        }
        self.peer_typing = is_typing;
        self.send(StreamEvent::Typing {
            from: peer,
            is_typing,
        })
        .await
    }

    async fn drain(mut self) {
        self.set_state(SessionState::Draining);
        self.cancel.cancel();

        let broadcaster = self.manager.service.broadcaster();
        let _ = broadcaster.unsubscribe(&self.subscription);
        self.push_rx.close();
        drop(self.permit.take());

        let conn = Arc::clone(&self.connection);
        self.manager.deregister(&conn.session_id);
        if !self.manager.has_session(&conn.identity, &conn.room) {
            if let Err(e) = self
                .service()
                .set_presence(&conn.room, &conn.identity, PresenceStatus::Offline)
                .await
            {
                warn!(error = %e, "failed to mark session offline");
            }
        }

        let _ = conn.close();
        self.set_state(SessionState::Closed);
        info!(
            watermark = self.watermark,
            dropped = conn.drop_count(),
            "live session closed"
        );
    }
}
