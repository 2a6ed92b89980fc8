//! Periodic identity refresh

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use tether_core::traits::{Authorizer, SessionHandler};
use tether_core::{AuthContext, AuthError};

use crate::registry::SessionRegistry;

/// Re-authorizes the device on a fixed period and publishes the result
pub struct IdentityRefresher {
    authorizer: Arc<dyn Authorizer>,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn SessionHandler>,
    auth: watch::Sender<AuthContext>,
    interval: Duration,
}

impl IdentityRefresher {
    /// Create a refresher publishing into `auth`
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        registry: Arc<SessionRegistry>,
        handler: Arc<dyn SessionHandler>,
        auth: watch::Sender<AuthContext>,
        interval: Duration,
    ) -> Self {
        Self {
            authorizer,
            registry,
            handler,
            auth,
            interval,
        }
    }

    /// Refresh every interval, starting one interval from now.
    ///
    /// Returns only when the server rejects the device for good.
    pub async fn run(self) -> Result<(), AuthError> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.refresh_once().await?;
        }
    }

    /// One authorization round.
    ///
    /// Transient failures keep the previous identity and return `Ok`.
    pub async fn refresh_once(&self) -> Result<(), AuthError> {
        let sessions = self.registry.snapshot_ids();

        match self.authorizer.authorize(&sessions).await {
            Ok(auth) => {
                let previous = self.auth.send_replace(auth.clone());
                if previous.device_name != auth.device_name {
                    tracing::info!(
                        "Device name changed from '{}' to '{}'",
                        previous.device_name,
                        auth.device_name
                    );
                    self.handler.set_device_name(&auth.device_name);
                }
                tracing::debug!("Identity refreshed with {} live sessions", sessions.len());
                Ok(())
            }
            Err(e) if e.is_permanent() => {
                tracing::error!("Device authorization revoked: {}", e);
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Failed to refresh identity, keeping the previous one: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tether_core::traits::BoxedStream;

    /// Returns scripted results and records the session ids it was given
    struct ScriptedAuthorizer {
        results: Mutex<VecDeque<Result<AuthContext, AuthError>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedAuthorizer {
        fn new(results: Vec<Result<AuthContext, AuthError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Authorizer for ScriptedAuthorizer {
        async fn authorize(&self, sessions: &[String]) -> Result<AuthContext, AuthError> {
            self.calls.lock().unwrap().push(sessions.to_vec());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::Transient("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        names: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionHandler for RecordingHandler {
        async fn handle(&self, _stream: BoxedStream, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn set_device_name(&self, name: &str) {
            self.names.lock().unwrap().push(name.to_string());
        }
    }

    fn context(name: &str) -> AuthContext {
        AuthContext {
            uid: "uid".into(),
            token: format!("token-{}", name),
            namespace: "acme".into(),
            tenant_name: name.into(),
            device_name: name.into(),
            ssh_host: "ssh.example.com".into(),
            ssh_port: 22,
        }
    }

    fn refresher(
        authorizer: Arc<ScriptedAuthorizer>,
        handler: Arc<RecordingHandler>,
    ) -> (IdentityRefresher, watch::Receiver<AuthContext>) {
        let (tx, rx) = watch::channel(context("device-42"));
        let refresher = IdentityRefresher::new(
            authorizer,
            Arc::new(SessionRegistry::new()),
            handler,
            tx,
            Duration::from_secs(600),
        );
        (refresher, rx)
    }

    #[tokio::test]
    async fn test_success_publishes_and_syncs_renamed_device() {
        let authorizer = ScriptedAuthorizer::new(vec![Ok(context("device-42")), Ok(context("renamed"))]);
        let handler = Arc::new(RecordingHandler::default());
        let (refresher, rx) = refresher(authorizer, handler.clone());

        refresher.refresh_once().await.unwrap();
        assert!(handler.names.lock().unwrap().is_empty());

        refresher.refresh_once().await.unwrap();
        assert_eq!(rx.borrow().device_name, "renamed");
        assert_eq!(rx.borrow().token, "token-renamed");
        assert_eq!(*handler.names.lock().unwrap(), vec!["renamed".to_string()]);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_previous_identity() {
        let authorizer = ScriptedAuthorizer::new(vec![Err(AuthError::Transient("timeout".into()))]);
        let handler = Arc::new(RecordingHandler::default());
        let (refresher, rx) = refresher(authorizer, handler.clone());

        refresher.refresh_once().await.unwrap();
        assert_eq!(rx.borrow().device_name, "device-42");
        assert!(handler.names.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_and_stops_on_rejection() {
        let authorizer = ScriptedAuthorizer::new(vec![
            Err(AuthError::Transient("timeout".into())),
            Ok(context("device-42")),
            Err(AuthError::Rejected("device removed".into())),
        ]);
        let handler = Arc::new(RecordingHandler::default());
        let (refresher, _rx) = refresher(authorizer.clone(), handler);

        let start = Instant::now();
        let result = refresher.run().await;

        assert!(matches!(result, Err(AuthError::Rejected(_))));
        assert_eq!(authorizer.calls.lock().unwrap().len(), 3);
        assert!(start.elapsed() >= Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_sends_live_session_ids() {
        let authorizer = ScriptedAuthorizer::new(vec![Ok(context("device-42"))]);
        let registry = Arc::new(SessionRegistry::new());
        let (tx, _rx) = watch::channel(AuthContext::default());
        let (out_tx, _out_rx) = tokio::sync::mpsc::channel(1);
        registry
            .put(crate::registry::Session::new(
                "abc",
                crate::tunnel::StreamHandle::new(tether_protocol::StreamId::new(1), out_tx),
            ))
            .unwrap();

        let refresher = IdentityRefresher::new(
            authorizer.clone(),
            registry,
            Arc::new(RecordingHandler::default()),
            tx,
            Duration::from_secs(600),
        );
        refresher.refresh_once().await.unwrap();

        assert_eq!(*authorizer.calls.lock().unwrap(), vec![vec!["abc".to_string()]]);
    }
}
