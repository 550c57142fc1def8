//! Where cached result sets live, keyed by user or conversation.

use crate::model::types::ResultSet;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    User,
    Conversation,
}

/// Opaque `(kind, id)` pair a result set is cached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub kind: SessionKind,
    pub id: i64,
}

impl SessionKey {
    pub fn user(id: i64) -> Self {
        Self {
            kind: SessionKind::User,
            id,
        }
    }

    pub fn conversation(id: i64) -> Self {
        Self {
            kind: SessionKind::Conversation,
            id,
        }
    }

    /// A private chat (user id equals chat id) caches per user; any other
    /// chat shares one result set among all of its members.
    pub fn resolve(user_id: i64, chat_id: i64) -> Self {
        if user_id == chat_id {
            Self::user(user_id)
        } else {
            Self::conversation(chat_id)
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SessionKind::User => write!(f, "user:{}", self.id),
            SessionKind::Conversation => write!(f, "conversation:{}", self.id),
        }
    }
}

/// One cached search. Immutable once published except for the access stamp.
#[derive(Debug)]
pub struct SessionSearchState {
    pub key: SessionKey,
    pub result: ResultSet,
    pub page_size: usize,
    /// Store-wide counter value reserved when the search started; strictly
    /// increases per key.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    created: Instant,
    /// Millis after `created` of the latest read.
    last_access_ms: AtomicU64,
}

impl SessionSearchState {
    pub fn page_count(&self) -> usize {
        self.result.total_count.div_ceil(self.page_size)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created + Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    fn touch(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.created).as_millis();
        self.last_access_ms
            .fetch_max(u64::try_from(offset).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}

/// Storage seam for session state.
///
/// Implementations replace state wholesale and hand out `Arc` snapshots, so
/// a reader keeps a consistent view even if the key is replaced or evicted
/// while it reads.
pub trait SessionStore: Send + Sync {
    /// Take the next generation number. A search reserves one before it
    /// runs so the order of publishes follows the order searches began.
    fn reserve_generation(&self) -> u64;
    /// Publish `result` under `key` unless state with a newer generation is
    /// already there. Returns the published state, or `None` when superseded.
    fn publish(
        &self,
        key: SessionKey,
        result: ResultSet,
        page_size: usize,
        generation: u64,
    ) -> Option<Arc<SessionSearchState>>;
    /// Publish `result` under `key` with a fresh generation, replacing any
    /// previous state.
    fn set(&self, key: SessionKey, result: ResultSet, page_size: usize) -> Arc<SessionSearchState>;
    /// Current state for `key`, marking it as accessed.
    fn get(&self, key: &SessionKey) -> Option<Arc<SessionSearchState>>;
    fn delete(&self, key: &SessionKey) -> bool;
    /// Drop every state idle for at least `ttl`. Returns how many were dropped.
    fn evict_idle(&self, ttl: Duration) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store bounded by an LRU on session count.
pub struct InMemorySessionStore {
    states: Mutex<LruCache<SessionKey, Arc<SessionSearchState>>>,
    generation: AtomicU64,
}

impl InMemorySessionStore {
    pub fn new(max_sessions: usize) -> Self {
        let cap = NonZeroUsize::new(max_sessions).unwrap_or(NonZeroUsize::MIN);
        Self {
            states: Mutex::new(LruCache::new(cap)),
            generation: AtomicU64::new(0),
        }
    }

    fn build(
        key: SessionKey,
        result: ResultSet,
        page_size: usize,
        generation: u64,
    ) -> Arc<SessionSearchState> {
        Arc::new(SessionSearchState {
            key,
            result,
            page_size: page_size.max(1),
            generation,
            created_at: Utc::now(),
            created: Instant::now(),
            last_access_ms: AtomicU64::new(0),
        })
    }

    fn push(
        states: &mut LruCache<SessionKey, Arc<SessionSearchState>>,
        state: &Arc<SessionSearchState>,
    ) {
        let key = state.key;
        if let Some((evicted, _)) = states.push(key, Arc::clone(state))
            && evicted != key
        {
            tracing::debug!(session = %evicted, "session evicted by capacity");
        }
    }
}

impl SessionStore for InMemorySessionStore {
    fn reserve_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn publish(
        &self,
        key: SessionKey,
        result: ResultSet,
        page_size: usize,
        generation: u64,
    ) -> Option<Arc<SessionSearchState>> {
        // Built fully before the lock; readers see the old state or this one.
        let state = Self::build(key, result, page_size, generation);
        let mut states = self.states.lock();
        if let Some(current) = states.peek(&key)
            && current.generation > generation
        {
            return None;
        }
        Self::push(&mut states, &state);
        Some(state)
    }

    fn set(&self, key: SessionKey, result: ResultSet, page_size: usize) -> Arc<SessionSearchState> {
        let state = Self::build(key, result, page_size, self.reserve_generation());
        Self::push(&mut self.states.lock(), &state);
        state
    }

    fn get(&self, key: &SessionKey) -> Option<Arc<SessionSearchState>> {
        let state = self.states.lock().get(key).map(Arc::clone)?;
        state.touch(Instant::now());
        Some(state)
    }

    fn delete(&self, key: &SessionKey) -> bool {
        self.states.lock().pop(key).is_some()
    }

    fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut states = self.states.lock();
        let stale: Vec<SessionKey> = states
            .iter()
            .filter(|(_, state)| state.idle_for(now) >= ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            states.pop(key);
        }
        stale.len()
    }

    fn len(&self) -> usize {
        self.states.lock().len()
    }
}
