//! Session registry with per-session locking.
//!
//! Each session sits behind its own `tokio::sync::Mutex`, so concurrent
//! requests for one session queue up and run one at a time while different
//! sessions proceed in parallel. The map itself is only write-locked to
//! create or remove a session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use trellis_core::BoxError;
use uuid::Uuid;

use crate::coordinator::CycleOutcome;
use crate::error::SyncError;
use crate::protocol::ClientMessage;
use crate::session::ServerSession;

pub type SharedSession = Arc<Mutex<ServerSession>>;

/// Builds the component tree of a new session.
pub trait UiProvider: Send + Sync + 'static {
    fn build(&self, session: &mut ServerSession) -> Result<(), BoxError>;
}

impl<F> UiProvider for F
where
    F: Fn(&mut ServerSession) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn build(&self, session: &mut ServerSession) -> Result<(), BoxError> {
        self(session)
    }
}

pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, SharedSession>>>,
    provider: Arc<dyn UiProvider>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(provider: impl UiProvider, max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            provider: Arc::new(provider),
            max_sessions,
        }
    }

    /// Create a session and build its UI.
    pub async fn create(&self) -> Result<(Uuid, SharedSession), SyncError> {
        let id = Uuid::new_v4();
        let mut session = ServerSession::new(id);
        self.provider
            .build(&mut session)
            .map_err(|e| SyncError::Provider(e.to_string()))?;

        let shared = Arc::new(Mutex::new(session));
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(SyncError::SessionLimit(self.max_sessions));
        }
        sessions.insert(id, Arc::clone(&shared));
        log::info!("Session {id} created ({} active)", sessions.len());
        Ok((id, shared))
    }

    pub async fn get(&self, id: &Uuid) -> Option<SharedSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Resume `id` if it exists, otherwise create a new session. The flag is
    /// `true` for a new session.
    pub async fn get_or_create(&self, id: Option<Uuid>) -> Result<(Uuid, SharedSession, bool), SyncError> {
        if let Some(id) = id {
            if let Some(session) = self.get(&id).await {
                return Ok((id, session, false));
            }
            log::debug!("Session {id} not found, creating a new one");
        }
        let (id, session) = self.create().await?;
        Ok((id, session, true))
    }

    /// Run one cycle for `id` under its session lock.
    pub async fn process(&self, id: &Uuid, message: &ClientMessage) -> Result<CycleOutcome, SyncError> {
        let session = self.get(id).await.ok_or(SyncError::SessionNotFound(*id))?;
        let mut session = session.lock().await;
        Ok(session.run_cycle(message)?)
    }

    /// Run `f` under the session lock. Changes it makes go out with the
    /// session's next cycle.
    pub async fn access<R>(&self, id: &Uuid, f: impl FnOnce(&mut ServerSession) -> R) -> Result<R, SyncError> {
        let session = self.get(id).await.ok_or(SyncError::SessionNotFound(*id))?;
        let mut session = session.lock().await;
        Ok(f(&mut *session))
    }

    pub async fn remove(&self, id: &Uuid) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            log::info!("Session {id} removed");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }
}

impl Clone for SessionManager {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            provider: Arc::clone(&self.provider),
            max_sessions: self.max_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KeyedCall;
    use std::time::Duration;
    use trellis_core::widgets::{CheckBox, CheckBoxServerRpc, Label};
    use trellis_core::{ComponentKey, RpcInterface};

    fn manager(max_sessions: usize) -> SessionManager {
        SessionManager::new(
            |session: &mut ServerSession| -> Result<(), BoxError> {
                session.attach(CheckBox::check_box("Agree"))?;
                session.attach(Label::label("idle"))?;
                Ok(())
            },
            max_sessions,
        )
    }

    fn click(seq: u64, checked: bool) -> ClientMessage {
        ClientMessage {
            seq,
            calls: vec![KeyedCall {
                key: ComponentKey::from("c0"),
                call: CheckBoxServerRpc::Clicked { checked }.into_call(),
            }],
        }
    }

    #[tokio::test]
    async fn test_create_builds_ui() {
        let manager = manager(4);
        let (id, session) = manager.create().await.unwrap();
        assert_eq!(session.lock().await.component_count(), 2);
        assert_eq!(manager.session_count().await, 1);
        assert_eq!(manager.session_ids().await, vec![id]);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let manager = manager(1);
        manager.create().await.unwrap();
        assert!(matches!(manager.create().await, Err(SyncError::SessionLimit(1))));
    }

    #[tokio::test]
    async fn test_get_or_create_resumes() {
        let manager = manager(4);
        let (id, _, created) = manager.get_or_create(None).await.unwrap();
        assert!(created);
        let (resumed, _, created) = manager.get_or_create(Some(id)).await.unwrap();
        assert_eq!(resumed, id);
        assert!(!created);

        let (other, _, created) = manager.get_or_create(Some(Uuid::new_v4())).await.unwrap();
        assert_ne!(other, id);
        assert!(created);
    }

    #[tokio::test]
    async fn test_process_unknown_session() {
        let manager = manager(4);
        let result = manager.process(&Uuid::new_v4(), &click(1, true)).await;
        assert!(matches!(result, Err(SyncError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_blocked_request_waits_for_lock() {
        let manager = manager(4);
        let (id, shared) = manager.create().await.unwrap();

        let guard = shared.lock().await;
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.process(&id, &click(1, true)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert!(waiter.await.unwrap().is_ok());
        let checked = manager
            .access(&id, |session| *session.component::<CheckBox>(&"c0".into()).unwrap().value())
            .await
            .unwrap();
        assert!(checked);
    }

    #[tokio::test]
    async fn test_sessions_run_independently() {
        let manager = manager(4);
        let (a, shared_a) = manager.create().await.unwrap();
        let (b, _) = manager.create().await.unwrap();

        let _guard = shared_a.lock().await;
        let result = tokio::time::timeout(Duration::from_secs(1), manager.process(&b, &click(1, true))).await;
        assert!(result.unwrap().is_ok());
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_access_changes_go_out_next_cycle() {
        let manager = manager(4);
        let (id, _) = manager.create().await.unwrap();
        manager
            .access(&id, |session| session.initial_message())
            .await
            .unwrap();

        manager
            .access(&id, |session| {
                session
                    .component_mut::<Label>(&"c1".into())
                    .unwrap()
                    .set_text("busy");
            })
            .await
            .unwrap();

        let outcome = manager
            .process(&id, &ClientMessage { seq: 1, calls: Vec::new() })
            .await
            .unwrap();
        assert!(outcome.response.update(&"c1".into()).is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let manager = manager(4);
        let (id, _) = manager.create().await.unwrap();
        assert!(manager.remove(&id).await);
        assert!(!manager.remove(&id).await);
        assert_eq!(manager.session_count().await, 0);
    }
}
