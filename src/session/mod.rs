//! In-memory session store.
//!
//! The map from session id to session is the only state shared across
//! requests. It is guarded by a `RwLock` held just long enough to look up or
//! insert an entry; each session then has its own `Mutex`, so a pipeline run
//! on one session never blocks another. A second request for a session that
//! is already running fails fast with `SessionBusy`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SessionConfig, StoreConfig};
use crate::models::Exchange;
use crate::store::{FlightDatabase, KnowledgeBase};
use crate::types::{AppError, AppResult};

/// Ended session ids remembered so later use reports `SessionNotFound`.
const ENDED_CAPACITY: usize = 4096;

pub type SessionGuard = OwnedMutexGuard<Session>;

pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    exchanges: Vec<Exchange>,
    store: Arc<FlightDatabase>,
}

impl Session {
    pub fn new(id: String, store: Arc<FlightDatabase>) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: now,
            exchanges: Vec::new(),
            store,
        }
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// The last `window` exchanges, oldest first.
    pub fn recent(&self, window: usize) -> &[Exchange] {
        let start = self.exchanges.len().saturating_sub(window);
        &self.exchanges[start..]
    }

    pub fn store(&self) -> &Arc<FlightDatabase> {
        &self.store
    }

    /// History only grows by whole user/assistant pairs.
    pub fn append_pair(&mut self, user: Exchange, assistant: Exchange) {
        self.exchanges.push(user);
        self.exchanges.push(assistant);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_idle(&self, timeout_seconds: i64) -> bool {
        Utc::now() - self.last_activity > Duration::seconds(timeout_seconds)
    }
}

#[derive(Default)]
struct EndedSessions {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl EndedSessions {
    fn insert(&mut self, id: String) {
        if self.ids.insert(id.clone()) {
            self.order.push_back(id);
        }
        while self.order.len() > ENDED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid session id regex"))
}

pub fn is_well_formed_id(id: &str) -> bool {
    session_id_pattern().is_match(id)
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    ended: RwLock<EndedSessions>,
    max_sessions: usize,
    idle_timeout_seconds: i64,
    data_dir: Option<PathBuf>,
    knowledge_base: Option<Arc<KnowledgeBase>>,
}

impl SessionStore {
    pub fn new(config: &SessionConfig, store: &StoreConfig, knowledge_base: Option<Arc<KnowledgeBase>>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ended: RwLock::new(EndedSessions::default()),
            max_sessions: config.max_sessions.max(1),
            idle_timeout_seconds: config.idle_timeout_seconds,
            data_dir: store.data_dir.clone(),
            knowledge_base,
        }
    }

    /// Lock the requested session, creating it when no id is given or the id
    /// is unknown. Fails with `SessionNotFound` for ended sessions and with
    /// `SessionBusy` when another request holds the session.
    pub async fn acquire(&self, requested: Option<&str>) -> AppResult<SessionGuard> {
        let id = match requested.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => {
                if self.ended.read().await.contains(id) {
                    return Err(AppError::SessionNotFound(id.to_string()));
                }
                if let Some(existing) = self.lookup(id).await {
                    return Self::lock(existing, id);
                }
                if is_well_formed_id(id) {
                    id.to_string()
                } else {
                    warn!(requested = %id, "Malformed session id, starting a new session");
                    Uuid::new_v4().to_string()
                }
            }
            None => Uuid::new_v4().to_string(),
        };

        self.create(id).await
    }

    /// Lock an existing session without creating one.
    pub async fn existing(&self, id: &str) -> AppResult<SessionGuard> {
        if self.ended.read().await.contains(id) {
            return Err(AppError::SessionNotFound(id.to_string()));
        }
        match self.lookup(id).await {
            Some(session) => Self::lock(session, id),
            None => Err(AppError::SessionNotFound(id.to_string())),
        }
    }

    /// End a session explicitly. Later use of the id reports `SessionNotFound`.
    pub async fn end_session(&self, id: &str) -> AppResult<()> {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(_) => {
                self.ended.write().await.insert(id.to_string());
                info!(session_id = %id, "Session ended");
                Ok(())
            }
            None => Err(AppError::SessionNotFound(id.to_string())),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop sessions idle for longer than the configured timeout. Sessions
    /// with a request in flight are never removed.
    pub async fn cleanup_idle_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.try_lock().map(|s| s.is_idle(self.idle_timeout_seconds)).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &idle {
            sessions.remove(id);
        }
        if !idle.is_empty() {
            info!(removed = idle.len(), remaining = sessions.len(), "Idle sessions cleaned up");
        }
        idle.len()
    }

    async fn lookup(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    fn lock(session: Arc<Mutex<Session>>, id: &str) -> AppResult<SessionGuard> {
        let mut guard = session
            .try_lock_owned()
            .map_err(|_| AppError::SessionBusy(id.to_string()))?;
        guard.touch();
        Ok(guard)
    }

    async fn create(&self, id: String) -> AppResult<SessionGuard> {
        // Open the table engine before taking the map lock.
        let db = FlightDatabase::open(&id, self.data_dir.as_deref())
            .await?
            .with_knowledge_base(self.knowledge_base.clone());

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&id).cloned() {
            drop(sessions);
            return Self::lock(existing, &id);
        }

        if sessions.len() >= self.max_sessions {
            self.evict(&mut sessions)?;
        }

        let session = Arc::new(Mutex::new(Session::new(id.clone(), Arc::new(db))));
        let guard = Self::lock(session.clone(), &id)?;
        sessions.insert(id.clone(), session);
        debug!(session_id = %id, active = sessions.len(), "Session created");
        Ok(guard)
    }

    /// Make room for one session: idle sessions first, then the least
    /// recently active one that is not running.
    fn evict(&self, sessions: &mut HashMap<String, Arc<Mutex<Session>>>) -> AppResult<()> {
        let mut idle = Vec::new();
        let mut oldest: Option<(String, DateTime<Utc>)> = None;
        for (id, session) in sessions.iter() {
            let Ok(session) = session.try_lock() else {
                continue;
            };
            if session.is_idle(self.idle_timeout_seconds) {
                idle.push(id.clone());
            } else if oldest.as_ref().map_or(true, |(_, at)| session.last_activity < *at) {
                oldest = Some((id.clone(), session.last_activity));
            }
        }

        if idle.is_empty() {
            match oldest {
                Some((id, _)) => idle.push(id),
                None => return Err(AppError::CapacityReached(sessions.len())),
            }
        }
        for id in &idle {
            sessions.remove(id);
        }
        info!(evicted = idle.len(), "Sessions evicted to stay under capacity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(max_sessions: usize) -> SessionStore {
        SessionStore::new(
            &SessionConfig {
                max_sessions,
                idle_timeout_seconds: 3600,
            },
            &StoreConfig::default(),
            None,
        )
    }

    #[tokio::test]
    async fn test_creates_session_when_absent() {
        let store = store_with(10);
        let guard = store.acquire(None).await.unwrap();
        assert!(Uuid::parse_str(&guard.id).is_ok());
        assert!(guard.exchanges().is_empty());
        drop(guard);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_well_formed_id_is_adopted() {
        let store = store_with(10);
        let guard = store.acquire(Some("flight-42")).await.unwrap();
        assert_eq!(guard.id, "flight-42");
        drop(guard);

        let again = store.acquire(Some("flight-42")).await.unwrap();
        assert_eq!(again.id, "flight-42");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_id_gets_fresh_session() {
        let store = store_with(10);
        let guard = store.acquire(Some("../../etc/passwd")).await.unwrap();
        assert_ne!(guard.id, "../../etc/passwd");
        assert!(is_well_formed_id(&guard.id));
    }

    #[tokio::test]
    async fn test_busy_session_fails_fast() {
        let store = store_with(10);
        let first = store.acquire(Some("s1")).await.unwrap();
        let second = store.acquire(Some("s1")).await;
        assert!(matches!(second, Err(AppError::SessionBusy(id)) if id == "s1"));

        // other sessions are unaffected
        assert!(store.acquire(Some("s2")).await.is_ok());
        drop(first);
        assert!(store.acquire(Some("s1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_ended_session_is_not_found() {
        let store = store_with(10);
        drop(store.acquire(Some("s1")).await.unwrap());
        store.end_session("s1").await.unwrap();

        assert!(matches!(store.acquire(Some("s1")).await, Err(AppError::SessionNotFound(_))));
        assert!(matches!(store.existing("s1").await, Err(AppError::SessionNotFound(_))));
        assert!(matches!(store.end_session("s1").await, Err(AppError::SessionNotFound(_))));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_existing_does_not_create() {
        let store = store_with(10);
        assert!(matches!(store.existing("nope").await, Err(AppError::SessionNotFound(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_append_pair_and_recent_window() {
        let store = store_with(10);
        let mut guard = store.acquire(None).await.unwrap();
        for i in 0..4 {
            guard.append_pair(
                Exchange::user(format!("q{i}"), Utc::now()),
                Exchange::assistant(
                    format!("a{i}"),
                    crate::models::ExchangePayload::new(None, crate::models::Resolution::Answered),
                ),
            );
        }
        assert_eq!(guard.exchanges().len(), 8);
        let recent: Vec<&str> = guard.recent(3).iter().map(|e| e.text.as_str()).collect();
        assert_eq!(recent, vec!["a2", "q3", "a3"]);
        assert_eq!(guard.recent(100).len(), 8);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent_unlocked() {
        let store = store_with(2);
        let held = store.acquire(Some("busy")).await.unwrap();
        drop(store.acquire(Some("old")).await.unwrap());

        drop(store.acquire(Some("new")).await.unwrap());
        assert_eq!(store.len().await, 2);
        assert!(store.existing("old").await.is_err());
        drop(held);
        assert!(store.existing("busy").await.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_reached_when_all_busy() {
        let store = store_with(1);
        let _held = store.acquire(Some("a")).await.unwrap();
        assert!(matches!(store.acquire(Some("b")).await, Err(AppError::CapacityReached(1))));
    }

    #[tokio::test]
    async fn test_cleanup_idle_sessions() {
        let store = SessionStore::new(
            &SessionConfig {
                max_sessions: 10,
                idle_timeout_seconds: -1,
            },
            &StoreConfig::default(),
            None,
        );
        drop(store.acquire(Some("a")).await.unwrap());
        let _held = store.acquire(Some("b")).await.unwrap();

        assert_eq!(store.cleanup_idle_sessions().await, 1);
        assert_eq!(store.len().await, 1);
    }
}
