//! Player session tracking.
//!
//! A session is a short-lived bearer token: possession authorizes position
//! updates for one player. Expiry is lazy (every lookup checks the
//! timestamp) plus a periodic sweep owned by the server runtime, so a
//! wedged client stops anchoring chunks within `SESSION_TIMEOUT`.

use crate::shared::protocol::SESSION_TIMEOUT;
use crate::shared::spatial::PrecisePosition;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct Session {
    pub token: String,
    pub player_name: String,
    pub player_id: u64,
    pub last_refresh: Instant,
    pub position: PrecisePosition,
}

impl Session {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_refresh) >= SESSION_TIMEOUT
    }
}

/// Token-keyed session table. Interior locking, like the rest of the shared
/// server state; callers never hold this lock across another acquisition.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

/// 128 bits of token entropy rendered as 32 hex chars.
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let hi: u64 = rng.gen();
    let lo: u64 = rng.gen();
    format!("{hi:016x}{lo:016x}")
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a session for a freshly connected player. Retries token
    /// generation on the (vanishingly unlikely) collision.
    pub fn create(&self, player_name: &str, player_id: u64, position: PrecisePosition) -> String {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let mut token = generate_token();
        while sessions.contains_key(&token) {
            token = generate_token();
        }
        sessions.insert(
            token.clone(),
            Session {
                token: token.clone(),
                player_name: player_name.to_string(),
                player_id,
                last_refresh: Instant::now(),
                position,
            },
        );
        token
    }

    /// Bump the expiry clock. False for unknown or already-expired tokens.
    pub fn refresh(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let now = Instant::now();
        match sessions.get_mut(token) {
            Some(session) if !session.is_expired(now) => {
                session.last_refresh = now;
                true
            }
            _ => false,
        }
    }

    /// Store a new position; also refreshes, a position update is proof of
    /// life.
    pub fn update_position(&self, token: &str, position: PrecisePosition) -> bool {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let now = Instant::now();
        match sessions.get_mut(token) {
            Some(session) if !session.is_expired(now) => {
                session.position = position;
                session.last_refresh = now;
                true
            }
            _ => false,
        }
    }

    pub fn is_valid(&self, token: &str) -> bool {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let now = Instant::now();
        sessions.get(token).is_some_and(|s| !s.is_expired(now))
    }

    /// Snapshot of one live session.
    pub fn get(&self, token: &str) -> Option<Session> {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let now = Instant::now();
        sessions.get(token).filter(|s| !s.is_expired(now)).cloned()
    }

    pub fn remove(&self, token: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        sessions.remove(token)
    }

    /// Sweep expired entries, returning their tokens so the caller can
    /// release whatever they anchored.
    pub fn remove_expired(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let now = Instant::now();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.token.clone())
            .collect();
        for token in &expired {
            sessions.remove(token);
        }
        expired
    }

    /// Snapshots of every live session.
    pub fn active_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let now = Instant::now();
        sessions
            .values()
            .filter(|s| !s.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        let now = Instant::now();
        sessions.values().filter(|s| !s.is_expired(now)).count()
    }
}
