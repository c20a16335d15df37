//! Real-time fan-out of conversation events to subscribed clients.
//!
//! Frames for one conversation carry a monotonically increasing `seq`, and
//! are queued in publish order. The hub never suppresses echoes: a client
//! that sent a message receives it back like everyone else. A client that
//! misses a frame is sent a `resync` notice or disconnected, never skipped
//! silently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use confab_core::events::EngineEvent;
use confab_core::ids::{ClientId, ConversationId, MessageId};

use crate::client::ClientRegistry;

#[derive(Default)]
struct Subscriber {
    unread: u64,
    /// A frame was dropped and a resync notice is queued.
    resync_pending: bool,
}

#[derive(Default)]
struct Room {
    seq: u64,
    subscribers: HashMap<ClientId, Subscriber>,
    /// Ids of the most recent messages, oldest first.
    recent: VecDeque<MessageId>,
}

/// Frame pushed to clients for every engine event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubFrame<'a> {
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub conversation_id: &'a ConversationId,
    pub seq: u64,
    pub timestamp: String,
    pub data: Value,
}

pub struct SyncHub {
    registry: Arc<ClientRegistry>,
    rooms: DashMap<ConversationId, Room>,
    unread_window: usize,
}

impl SyncHub {
    pub fn new(registry: Arc<ClientRegistry>, unread_window: usize) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
            unread_window: unread_window.max(1),
        }
    }

    /// Start delivering a conversation's events to `client_id`. Subscribing
    /// twice keeps the existing unread count.
    pub fn subscribe(&self, conversation_id: &ConversationId, client_id: &ClientId) {
        let mut room = self.rooms.entry(conversation_id.clone()).or_default();
        let _ = room.subscribers.entry(client_id.clone()).or_default();
        debug!(conversation_id = %conversation_id, client_id = %client_id, "subscribed");
    }

    /// Rooms left without subscribers are discarded.
    pub fn unsubscribe(&self, conversation_id: &ConversationId, client_id: &ClientId) -> bool {
        let removed = self
            .rooms
            .get_mut(conversation_id)
            .is_some_and(|mut room| room.subscribers.remove(client_id).is_some());
        let _ = self
            .rooms
            .remove_if(conversation_id, |_, room| room.subscribers.is_empty());
        removed
    }

    /// Drop every subscription a disconnected client held.
    pub fn drop_client(&self, client_id: &ClientId) {
        self.rooms.retain(|_, room| {
            let _ = room.subscribers.remove(client_id);
            !room.subscribers.is_empty()
        });
    }

    pub fn subscribers(&self, conversation_id: &ConversationId) -> Vec<ClientId> {
        self.rooms
            .get(conversation_id)
            .map(|room| room.subscribers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Fan an event out to the conversation's subscribers. Returns the
    /// number of clients the frame was queued for.
    ///
    /// A subscriber whose queue is full gets a `resync` notice in the slot
    /// the registry keeps free, naming the last `seq` it was sent. If even
    /// that fails the client is disconnected so it reloads on reconnect.
    pub fn publish(&self, event: &EngineEvent) -> usize {
        let conversation_id = event.conversation_id();
        let Some(mut room) = self.rooms.get_mut(conversation_id) else {
            return 0;
        };
        room.seq += 1;
        let seq = room.seq;

        if let EngineEvent::MessageAppended { message, .. } = event {
            room.recent.push_back(message.id.clone());
            while room.recent.len() > self.unread_window {
                let _ = room.recent.pop_front();
            }
            for subscriber in room.subscribers.values_mut() {
                subscriber.unread += 1;
            }
        }

        let frame = HubFrame {
            event_type: event.event_type(),
            conversation_id,
            seq,
            timestamp: Utc::now().to_rfc3339(),
            data: serde_json::to_value(event).unwrap_or(Value::Null),
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            warn!(conversation_id = %conversation_id, "event frame could not be serialized");
            return 0;
        };

        // Queued while the room is held so frames keep publish order.
        let mut delivered = 0;
        let mut lost = Vec::new();
        for (client_id, subscriber) in room.subscribers.iter_mut() {
            if self.registry.send_to(client_id, text.clone()) {
                subscriber.resync_pending = false;
                delivered += 1;
                continue;
            }
            if subscriber.resync_pending {
                continue;
            }
            let notice = json!({
                "type": "resync",
                "conversationId": conversation_id,
                "lastSeq": seq - 1,
            })
            .to_string();
            if self.registry.send_reserved(client_id, notice) {
                warn!(conversation_id = %conversation_id, client_id = %client_id, seq, "frame dropped, resync queued");
                subscriber.resync_pending = true;
            } else {
                lost.push(client_id.clone());
            }
        }
        for client_id in lost {
            let _ = room.subscribers.remove(&client_id);
            if self.registry.unregister(&client_id) {
                warn!(conversation_id = %conversation_id, client_id = %client_id, "client cannot keep up, disconnected");
            }
        }
        let emptied = room.subscribers.is_empty();
        drop(room);
        if emptied {
            let _ = self
                .rooms
                .remove_if(conversation_id, |_, room| room.subscribers.is_empty());
        }
        delivered
    }

    /// Tell every subscriber that frames were lost and it should reload.
    pub fn request_resync(&self, skipped: u64) {
        let frame = json!({"type": "resync", "skipped": skipped}).to_string();
        for room in self.rooms.iter() {
            for client_id in room.subscribers.keys() {
                let _ = self.registry.send_reserved(client_id, frame.clone());
            }
        }
    }

    pub fn unread(&self, conversation_id: &ConversationId, client_id: &ClientId) -> u64 {
        self.rooms
            .get(conversation_id)
            .and_then(|room| room.subscribers.get(client_id).map(|s| s.unread))
            .unwrap_or(0)
    }

    /// Mark everything up to and including `up_to` as read and return what
    /// remains unread. An id older than the tracked window clears the count.
    pub fn mark_read(
        &self,
        conversation_id: &ConversationId,
        client_id: &ClientId,
        up_to: &MessageId,
    ) -> u64 {
        let Some(mut room) = self.rooms.get_mut(conversation_id) else {
            return 0;
        };
        let newer = room
            .recent
            .iter()
            .position(|id| id == up_to)
            .map_or(0, |pos| (room.recent.len() - pos - 1) as u64);
        match room.subscribers.get_mut(client_id) {
            Some(subscriber) => {
                subscriber.unread = subscriber.unread.min(newer);
                subscriber.unread
            }
            None => 0,
        }
    }

    pub fn seq(&self, conversation_id: &ConversationId) -> u64 {
        self.rooms.get(conversation_id).map_or(0, |room| room.seq)
    }
}
