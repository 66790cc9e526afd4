//! In-process deduplication of message writes.
//!
//! Overlapping `save` calls for the same logical message share one underlying write: the
//! first caller performs it, later callers poll until the outcome is cached and return that.
//! The guard is advisory and lives only as long as the process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chatloop_common::{ConversationMessage, Result, SessionId};
use ring::digest;
use tracing::{debug, warn};

use crate::store::{MessageStore, NewMessage, PersistedMessage};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Composite dedupe key. Used only as a map key, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistenceKey(String);

impl PersistenceKey {
    pub fn derive(session_id: &SessionId, message: &ConversationMessage) -> Self {
        let signature = if !message.function_calls.is_empty() {
            let calls = serde_json::to_string(&message.function_calls).unwrap_or_default();
            format!("calls:{}", sha256_hex(calls.as_bytes()))
        } else if !message.tool_calls.is_empty() {
            let calls = serde_json::to_string(&message.tool_calls).unwrap_or_default();
            format!("calls:{}", sha256_hex(calls.as_bytes()))
        } else {
            format!("content:{}", sha256_hex(message.content.as_bytes()))
        };

        Self(format!(
            "{}|{}|{}|{}",
            session_id,
            message.role.as_str(),
            signature,
            message.created_at.timestamp_micros()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    digest::digest(&digest::SHA256, bytes)
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Default)]
struct GuardState {
    in_flight: HashSet<PersistenceKey>,
    completed: HashMap<PersistenceKey, PersistedMessage>,
    completed_order: VecDeque<PersistenceKey>,
}

impl GuardState {
    fn remember(&mut self, key: PersistenceKey, persisted: PersistedMessage, capacity: usize) {
        if self.completed.insert(key.clone(), persisted).is_none() {
            self.completed_order.push_back(key);
        }
        while self.completed_order.len() > capacity {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}

pub struct MessagePersistenceGuard {
    store: Arc<dyn MessageStore>,
    state: Arc<Mutex<GuardState>>,
    poll_interval: Duration,
    cache_capacity: usize,
}

/// Releases the in-flight marker however the write ends, including when the
/// saving future is dropped.
struct InFlightMarker {
    state: Arc<Mutex<GuardState>>,
    key: PersistenceKey,
}

impl Drop for InFlightMarker {
    fn drop(&mut self) {
        lock(&self.state).in_flight.remove(&self.key);
    }
}

enum Claim {
    Cached(PersistedMessage),
    Wait,
    Owned(InFlightMarker),
}

fn lock(state: &Mutex<GuardState>) -> MutexGuard<'_, GuardState> {
    // The state is plain maps; a panic elsewhere cannot leave it half-updated.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MessagePersistenceGuard {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(GuardState::default())),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bound the number of completed outcomes kept for late duplicates. The oldest are
    /// evicted first.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    /// Persist `message`, or return the record of an identical save already made or in flight.
    pub async fn save(&self, message: NewMessage) -> Result<PersistedMessage> {
        let key = PersistenceKey::derive(&message.session_id, &message.message);

        let marker = loop {
            match self.claim(&key) {
                Claim::Cached(persisted) => {
                    debug!(key = key.as_str(), "duplicate save resolved from cache");
                    return Ok(persisted);
                }
                Claim::Wait => tokio::time::sleep(self.poll_interval).await,
                Claim::Owned(marker) => break marker,
            }
        };

        match self.store.create_message(&message).await {
            Ok(persisted) => {
                lock(&self.state).remember(key, persisted.clone(), self.cache_capacity);
                drop(marker);
                Ok(persisted)
            }
            Err(e) => {
                warn!(key = key.as_str(), "message write failed: {e}");
                drop(marker);
                Err(e)
            }
        }
    }

    fn claim(&self, key: &PersistenceKey) -> Claim {
        let mut state = lock(&self.state);
        if let Some(persisted) = state.completed.get(key) {
            return Claim::Cached(persisted.clone());
        }
        if state.in_flight.contains(key) {
            return Claim::Wait;
        }
        state.in_flight.insert(key.clone());
        Claim::Owned(InFlightMarker {
            state: Arc::clone(&self.state),
            key: key.clone(),
        })
    }

    pub fn is_in_flight(&self, key: &PersistenceKey) -> bool {
        lock(&self.state).in_flight.contains(key)
    }

    pub fn cached(&self, key: &PersistenceKey) -> Option<PersistedMessage> {
        lock(&self.state).completed.get(key).cloned()
    }

    /// Forget every cached outcome. In-flight saves are unaffected.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.completed.clear();
        state.completed_order.clear();
    }
}
