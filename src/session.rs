//! Per-user conversation sessions.
//!
//! Sessions live only in memory and are lost on restart; /new is the only
//! way to discard one.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::gemini::ChatSession;

/// Maps a Telegram user id to its open chat session.
///
/// `get_or_create` is atomic under the store mutex, so two overlapping
/// messages from the same user end up contending on the same per-session
/// mutex and their turns serialize. The map is unbounded by design.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<u64, Arc<Mutex<ChatSession>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the user's session handle, creating one if absent.
    pub async fn get_or_create(&self, user_id: u64) -> Arc<Mutex<ChatSession>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChatSession::new())))
            .clone()
    }

    /// Drop the user's session. Returns whether one existed.
    pub async fn reset(&self, user_id: u64) -> bool {
        self.sessions.lock().await.remove(&user_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_exactly_one_session() {
        let store = SessionStore::new();
        let first = store.get_or_create(42).await;
        let second = store.get_or_create(42).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_sessions_are_per_user() {
        let store = SessionStore::new();
        let alice = store.get_or_create(1).await;
        let bob = store.get_or_create(2).await;
        assert!(!Arc::ptr_eq(&alice, &bob));
    }

    #[tokio::test]
    async fn test_reset_without_session() {
        let store = SessionStore::new();
        assert!(!store.reset(42).await);
    }

    #[tokio::test]
    async fn test_reset_removes_session() {
        let store = SessionStore::new();
        let old = store.get_or_create(42).await;
        assert!(store.reset(42).await);

        // A fresh handle, not the old one.
        let fresh = store.get_or_create(42).await;
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.lock().await.turns(), 0);
    }

    #[tokio::test]
    async fn test_history_survives_across_messages() {
        let store = SessionStore::new();

        {
            let handle = store.get_or_create(7).await;
            let mut session = handle.lock().await;
            session.push_user("Hello");
            session.push_model("Hi!");
        }

        // Second message from the same user sees the earlier turns.
        let handle = store.get_or_create(7).await;
        let session = handle.lock().await;
        assert_eq!(session.turns(), 2);
        assert_eq!(session.user_text_len(), "Hello".len());
    }
}
