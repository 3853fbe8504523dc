// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use aria_agents::AgentKind;

use crate::events::{Event, EventKind};

/// Per-session publish/subscribe with a bounded replay buffer.
///
/// Emission appends to the session's ring buffer and fans out over a
/// `broadcast` channel.  A subscriber that falls more than the channel
/// capacity behind loses its oldest undelivered events — the transport layer
/// observes this as a `Lagged` receive error and should surface a
/// subscriber-lagged warning to its client.
///
/// Ordering is FIFO within a session; ordering across sessions is
/// unspecified.  The bus holds sessions only by id — it never owns session
/// state.
pub struct EventBus {
    sessions: Mutex<HashMap<Uuid, SessionChannel>>,
    buffer_cap: usize,
    subscriber_cap: usize,
}

struct SessionChannel {
    /// Sequence number of the most recently emitted event.
    seq: u64,
    buffer: VecDeque<Event>,
    tx: broadcast::Sender<Event>,
}

/// A live subscription: the replayed backlog plus the live receiver.
#[derive(Debug)]
pub struct Subscription {
    /// Buffered events replayed at subscribe time, oldest first.  May begin
    /// with a `gap` marker when the requested resume point was evicted.
    pub backlog: Vec<Event>,
    pub rx: broadcast::Receiver<Event>,
}

impl EventBus {
    pub fn new(buffer_cap: usize, subscriber_cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            buffer_cap: buffer_cap.max(1),
            subscriber_cap: subscriber_cap.max(1),
        }
    }

    /// Emit an event on a session's stream.  Creates the channel on first
    /// use.  Returns the event as emitted (with its assigned id).
    pub fn emit(
        &self,
        session_id: Uuid,
        agent_kind: AgentKind,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Event {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let channel = sessions.entry(session_id).or_insert_with(|| SessionChannel {
            seq: 0,
            buffer: VecDeque::with_capacity(self.buffer_cap),
            tx: broadcast::channel(self.subscriber_cap).0,
        });
        channel.seq += 1;
        let event = Event {
            event_id: channel.seq,
            session_id,
            agent_kind,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        if channel.buffer.len() == self.buffer_cap {
            channel.buffer.pop_front();
        }
        channel.buffer.push_back(event.clone());
        // No subscribers is fine; the buffer still retains the event.
        let _ = channel.tx.send(event.clone());
        event
    }

    /// Subscribe to a session's stream.
    ///
    /// `last_event_id = None` replays the whole retained buffer.  With
    /// `Some(n)`, buffered events with `event_id > n` are replayed; when the
    /// requested resume point has been evicted, the backlog starts with a
    /// single `gap` marker naming the oldest retained id.
    pub fn subscribe(&self, session_id: Uuid, last_event_id: Option<u64>) -> Subscription {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let channel = sessions.entry(session_id).or_insert_with(|| SessionChannel {
            seq: 0,
            buffer: VecDeque::with_capacity(self.buffer_cap),
            tx: broadcast::channel(self.subscriber_cap).0,
        });
        let rx = channel.tx.subscribe();

        let backlog = match last_event_id {
            None => channel.buffer.iter().cloned().collect(),
            Some(n) => {
                let oldest = channel.buffer.front().map(|e| e.event_id);
                let mut backlog: Vec<Event> = Vec::new();
                if let Some(oldest) = oldest {
                    if n + 1 < oldest {
                        debug!(%session_id, requested = n, oldest, "replay gap");
                        backlog.push(Event {
                            event_id: n,
                            session_id,
                            agent_kind: channel
                                .buffer
                                .front()
                                .map(|e| e.agent_kind)
                                .unwrap_or(AgentKind::Personal),
                            kind: EventKind::Gap,
                            payload: serde_json::json!({ "oldest_retained": oldest }),
                            timestamp: Utc::now(),
                        });
                    }
                }
                backlog.extend(channel.buffer.iter().filter(|e| e.event_id > n).cloned());
                backlog
            }
        };

        Subscription { backlog, rx }
    }

    /// Most recent event id for a session (0 when none emitted).
    pub fn last_event_id(&self, session_id: Uuid) -> u64 {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(&session_id).map(|c| c.seq).unwrap_or(0)
    }

    /// Drop a session's channel, detaching all subscribers.  Callers emit
    /// `session_end` *before* closing so subscribers observe the terminal
    /// event, then see the stream close.
    pub fn close(&self, session_id: Uuid) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&session_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
