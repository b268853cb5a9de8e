//! Room registry and fan-out for push connections.
//!
//! Each connection owns a bounded outbound queue. Broadcasts never wait on
//! it: a full queue drops the connection.

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use payment_contracts::{PaymentEvent, PaymentEventType, Provider};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::auth::{AuthenticatedClient, ConnectionSlot, PushAuth};
use super::message::{frame_type, ClientMessage, ServerFrame};
use super::rooms::{provider_room, tenant_room, user_room, RoomSpec, Scope, SubscriptionFilter};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Item on a connection's outbound queue
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Utf8Bytes),
    Close,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub max_connections_per_user: usize,
    pub messages_per_minute: u32,
    pub outbound_buffer: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 5,
            messages_per_minute: 60,
            outbound_buffer: 256,
        }
    }
}

/// Whether the socket should stay open after a client message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    Continue,
    Disconnect,
}

struct Connection {
    user_id: String,
    tenant_id: Option<String>,
    admin: bool,
    tx: mpsc::Sender<Outbound>,
    rooms: HashSet<String>,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    _slot: Arc<ConnectionSlot>,
}

impl Connection {
    fn scope(&self) -> Scope {
        match (&self.tenant_id, self.admin) {
            (_, true) => Scope::All,
            (Some(t), false) => Scope::Tenant(t.clone()),
            (None, false) => Scope::Global,
        }
    }
}

struct Room {
    /// Set for subscription rooms; evaluated once per broadcast
    spec: Option<RoomSpec>,
    members: HashSet<ConnectionId>,
}

pub struct PushHub {
    config: PushConfig,
    auth: Option<PushAuth>,
    connections: DashMap<ConnectionId, Connection>,
    rooms: DashMap<String, Room>,
    user_counts: Arc<DashMap<String, usize>>,
    shutting_down: AtomicBool,
}

fn encode(frame: &ServerFrame) -> Option<Utf8Bytes> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Utf8Bytes::from(text)),
        Err(e) => {
            error!(error = %e, frame_type = %frame.frame_type, "Failed to serialize frame");
            None
        }
    }
}

impl PushHub {
    /// Without `auth` every handshake is refused.
    pub fn new(config: PushConfig, auth: Option<PushAuth>) -> Self {
        Self {
            config,
            auth,
            connections: DashMap::new(),
            rooms: DashMap::new(),
            user_counts: Arc::new(DashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn auth(&self) -> Option<&PushAuth> {
        self.auth.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn try_acquire_slot(&self, user_id: &str) -> Option<ConnectionSlot> {
        ConnectionSlot::acquire(&self.user_counts, user_id, self.config.max_connections_per_user)
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn room_members(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |r| r.members.len())
    }

    /// Admit an authenticated client. Joins its user and tenant rooms (admins
    /// also every provider room) and queues `connection.established`.
    pub fn register(&self, client: AuthenticatedClient) -> Option<(ConnectionId, mpsc::Receiver<Outbound>)> {
        if self.is_shutting_down() {
            return None;
        }

        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let per_minute = NonZeroU32::new(self.config.messages_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        let claims = client.claims;
        let admin = claims.is_admin();

        let mut rooms = vec![user_room(&claims.sub)];
        if let Some(t) = &claims.tenant_id {
            rooms.push(tenant_room(t));
        }
        if admin {
            rooms.extend(Provider::ALL.into_iter().map(provider_room));
        }

        self.connections.insert(
            id,
            Connection {
                user_id: claims.sub.clone(),
                tenant_id: claims.tenant_id.clone(),
                admin,
                tx,
                rooms: HashSet::new(),
                limiter: RateLimiter::direct(Quota::per_minute(per_minute).allow_burst(per_minute)),
                _slot: client.slot,
            },
        );
        for room in rooms {
            self.join(id, room);
        }

        info!(%id, user_id = %claims.sub, tenant_id = ?claims.tenant_id, "Push connection registered");
        self.send(
            id,
            ServerFrame::new(
                frame_type::CONNECTION_ESTABLISHED,
                json!({
                    "socketId": id.to_string(),
                    "userId": claims.sub,
                    "tenantId": claims.tenant_id,
                }),
            ),
        );
        Some((id, rx))
    }

    /// Remove a connection and its memberships. Dropping its sender ends the
    /// socket's send loop once the queue drains.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return false;
        };
        for room in &conn.rooms {
            self.remove_member(room, id);
        }
        debug!(%id, user_id = %conn.user_id, "Push connection unregistered");
        true
    }

    fn join(&self, id: ConnectionId, room: String) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut conn) => {
                conn.rooms.insert(room.clone());
            }
            None => return false,
        }
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| Room {
                spec: RoomSpec::parse(&room),
                members: HashSet::new(),
            })
            .members
            .insert(id);
        true
    }

    fn leave(&self, id: ConnectionId, room: &str) -> bool {
        let removed = match self.connections.get_mut(&id) {
            Some(mut conn) => conn.rooms.remove(room),
            None => false,
        };
        if removed {
            self.remove_member(room, id);
        }
        removed
    }

    fn remove_member(&self, room: &str, id: ConnectionId) {
        if let Some(mut r) = self.rooms.get_mut(room) {
            r.members.remove(&id);
        }
        self.rooms.remove_if(room, |_, r| r.members.is_empty());
    }

    fn send(&self, id: ConnectionId, frame: ServerFrame) -> bool {
        let Some(text) = encode(&frame) else {
            return false;
        };
        match self.connections.get(&id) {
            Some(conn) => conn.tx.try_send(Outbound::Frame(text)).is_ok(),
            None => false,
        }
    }

    fn close(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.get(&id) {
            let _ = conn.tx.try_send(Outbound::Close);
        }
    }

    pub fn handle_client_message(&self, id: ConnectionId, text: &str) -> ClientAction {
        let limited = match self.connections.get(&id) {
            Some(conn) => conn.limiter.check().is_err(),
            None => return ClientAction::Disconnect,
        };
        if limited {
            warn!(%id, "Push client exceeded message rate, disconnecting");
            self.send(id, ServerFrame::error("rate limit exceeded"));
            self.close(id);
            return ClientAction::Disconnect;
        }

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                self.send(id, ServerFrame::error(format!("invalid message: {e}")));
                return ClientAction::Continue;
            }
        };

        let reply = match message {
            ClientMessage::Subscribe {
                event_types,
                filters,
            } => self.subscribe(id, &event_types, filters.unwrap_or_default()),
            ClientMessage::Unsubscribe { event_types } => self.unsubscribe(id, &event_types),
            ClientMessage::JoinTenant { tenant_id } => self.join_tenant(id, tenant_id),
            ClientMessage::LeaveTenant { tenant_id } => {
                let left = self.leave(id, &tenant_room(&tenant_id));
                ServerFrame::new(
                    frame_type::TENANT_LEFT,
                    json!({ "tenantId": tenant_id, "left": left }),
                )
            }
            ClientMessage::Ping => ServerFrame::new(frame_type::PONG, json!({})),
        };
        self.send(id, reply);
        ClientAction::Continue
    }

    fn parse_types(event_types: &[String]) -> Result<Vec<PaymentEventType>, ServerFrame> {
        if event_types.is_empty() {
            return Err(ServerFrame::error("eventTypes must not be empty"));
        }
        let mut parsed = Vec::with_capacity(event_types.len());
        for t in event_types {
            match t.parse::<PaymentEventType>() {
                Ok(t) => parsed.push(t),
                Err(_) => return Err(ServerFrame::error(format!("unknown event type: {t}"))),
            }
        }
        Ok(parsed)
    }

    fn subscribe(&self, id: ConnectionId, event_types: &[String], filter: SubscriptionFilter) -> ServerFrame {
        let types = match Self::parse_types(event_types) {
            Ok(t) => t,
            Err(frame) => return frame,
        };
        let Some(scope) = self.connections.get(&id).map(|c| c.scope()) else {
            return ServerFrame::error("connection closed");
        };

        let mut rooms = Vec::with_capacity(types.len());
        for t in types {
            let spec = RoomSpec::new(scope.clone(), t, filter.clone());
            let name = spec.name();
            if RoomSpec::parse(&name).as_ref() != Some(&spec) {
                warn!(connection = %id, room = %name, "subscription room does not round-trip");
                return ServerFrame::error("subscription filter cannot be encoded");
            }
            rooms.push(name);
        }
        for room in &rooms {
            self.join(id, room.clone());
        }
        ServerFrame::new(
            frame_type::SUBSCRIBED,
            json!({ "eventTypes": event_types, "rooms": rooms }),
        )
    }

    fn unsubscribe(&self, id: ConnectionId, event_types: &[String]) -> ServerFrame {
        let types = match Self::parse_types(event_types) {
            Ok(t) => t,
            Err(frame) => return frame,
        };
        let matching: Vec<String> = match self.connections.get(&id) {
            Some(conn) => conn
                .rooms
                .iter()
                .filter(|r| RoomSpec::parse(r).is_some_and(|s| types.contains(&s.event_type)))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        for room in &matching {
            self.leave(id, room);
        }
        ServerFrame::new(
            frame_type::UNSUBSCRIBED,
            json!({ "eventTypes": event_types, "rooms": matching }),
        )
    }

    fn join_tenant(&self, id: ConnectionId, tenant_id: String) -> ServerFrame {
        let permitted = self
            .connections
            .get(&id)
            .is_some_and(|c| c.admin || c.tenant_id.as_deref() == Some(tenant_id.as_str()));
        if !permitted {
            return ServerFrame::error(format!("not permitted to join tenant {tenant_id}"));
        }
        self.join(id, tenant_room(&tenant_id));
        ServerFrame::new(frame_type::TENANT_JOINED, json!({ "tenantId": tenant_id }))
    }

    /// Rooms an event is delivered to, with a snapshot of their members
    fn targets(&self, event: &PaymentEvent) -> Vec<(String, Vec<ConnectionId>)> {
        let mut targets: Vec<(String, Vec<ConnectionId>)> = self
            .rooms
            .iter()
            .filter(|r| r.spec.as_ref().is_some_and(|s| s.matches(event)))
            .map(|r| (r.key().clone(), r.members.iter().copied().collect()))
            .collect();

        let mut fixed = vec![provider_room(event.provider)];
        if let Some(t) = event.tenant_id() {
            fixed.push(tenant_room(t));
        }
        if let Some(u) = event.user_id() {
            fixed.push(user_room(u));
        }
        for name in fixed {
            if let Some(r) = self.rooms.get(&name) {
                targets.push((name, r.members.iter().copied().collect()));
            }
        }
        targets
    }

    /// Deliver `event` once per matching room. Returns frames queued.
    pub fn broadcast(&self, event: &PaymentEvent) -> usize {
        let targets = self.targets(event);
        if targets.is_empty() {
            return 0;
        }

        let mut payload = json!({
            "transaction": event.transaction,
            "provider": event.provider,
            "correlationId": event.correlation_id,
            "receivedAt": event.received_at,
        });
        if let Some(err) = &event.error {
            payload["error"] = Value::String(err.clone());
        }

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (room, members) in targets {
            payload["room"] = Value::String(room);
            let frame = ServerFrame::new(event.event_type.as_str(), payload.clone()).with_scope(
                event.tenant_id().map(str::to_string),
                event.user_id().map(str::to_string),
            );
            let Some(text) = encode(&frame) else {
                continue;
            };

            for id in members {
                let Some(conn) = self.connections.get(&id) else {
                    continue;
                };
                match conn.tx.try_send(Outbound::Frame(text.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%id, user_id = %conn.user_id, "Outbound queue full, dropping connection");
                        dropped.push(id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
                }
            }
        }

        for id in dropped {
            self.unregister(id);
        }
        delivered
    }

    /// Refuse new connections, tell existing ones, then close them.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        for id in &ids {
            self.send(
                *id,
                ServerFrame::new(frame_type::SERVER_SHUTDOWN, json!({ "reason": "server shutting down" })),
            );
            self.close(*id);
            self.unregister(*id);
        }
        info!(connections = ids.len(), "Push channel shut down");
        ids.len()
    }
}
