//! Reconnection supervisor
//!
//! Keeps exactly one control connection alive: dial, serve until the
//! connection is lost, wait, dial again. Dial failures, rejected
//! registrations and lost connections all take the same path through the
//! backoff.

use std::sync::Arc;

use tokio::sync::watch;

use tether_core::{AuthContext, ConnectionState};

use super::connector::Dialer;
use super::reconnect::Backoff;
use crate::router::Router;

/// Owns the control connection for the lifetime of the agent
pub struct Supervisor {
    dialer: Arc<dyn Dialer>,
    auth: watch::Receiver<AuthContext>,
    router: Arc<Router>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
}

impl Supervisor {
    /// Create a supervisor.
    ///
    /// The identity is read from `auth` before every dial, so refreshed
    /// credentials apply to the next connection.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        auth: watch::Receiver<AuthContext>,
        router: Arc<Router>,
        backoff: Backoff,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            dialer,
            auth,
            router,
            backoff,
            state,
        }
    }

    /// Observe the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run forever
    pub async fn run(mut self) {
        loop {
            self.run_once().await;

            let delay = self.backoff.next_delay();
            tracing::info!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One dial and, if it succeeds, one connection lifetime
    async fn run_once(&mut self) {
        let auth = self.auth.borrow().clone();

        self.state.send_replace(ConnectionState::Dialing);
        match self.dialer.dial(&auth).await {
            Ok(listener) => {
                tracing::info!(
                    namespace = %auth.namespace,
                    hostname = %auth.tenant_name,
                    ssh_server = %auth.ssh_endpoint(),
                    sshid = %auth.connection_identifier(),
                    "Server connection established"
                );
                self.state.send_replace(ConnectionState::Listening);
                self.backoff.reset();

                let reason = Arc::clone(&self.router).serve(listener).await;
                tracing::warn!("Server connection lost: {}", reason);
            }
            Err(e) => tracing::warn!("Failed to connect to server: {}", e),
        }
        self.state.send_replace(ConnectionState::Idle);
    }
}
