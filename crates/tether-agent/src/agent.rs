//! Agent wiring
//!
//! Builds the collaborators from configuration and runs the two long-lived
//! loops: the reconnection supervisor on its own task and the identity
//! refresh on the caller's task.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use tether_core::config::{AgentConfig, TransportKind};
use tether_core::traits::{Authorizer, SessionHandler};
use tether_core::AuthContext;

use crate::auth::{
    ensure_device_key, load_device_key, public_key_openssh, DeviceInfo, HttpAuthorizer,
    HttpAuthorizerConfig, IdentityRefresher,
};
use crate::bridge::ProxyConfig;
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::shell::{PtyShell, SingleUserCredential};
use crate::tunnel::{Backoff, DialOptions, Dialer, ListenerOptions, SshDialer, TcpDialer, Supervisor};

/// The device agent
pub struct Agent {
    config: AgentConfig,
    registry: Arc<SessionRegistry>,
    authorizer: Arc<dyn Authorizer>,
    handler: Arc<dyn SessionHandler>,
    dialer: Arc<dyn Dialer>,
}

impl Agent {
    /// Assemble an agent from explicit collaborators
    pub fn new(
        config: AgentConfig,
        authorizer: Arc<dyn Authorizer>,
        handler: Arc<dyn SessionHandler>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            authorizer,
            handler,
            dialer,
        }
    }

    /// Build the production collaborators: HTTP authorizer, PTY shell and
    /// the configured transport.
    pub async fn from_config(config: AgentConfig) -> Result<Self> {
        ensure_device_key(&config.private_key_path).await?;
        let key = load_device_key(&config.private_key_path)?;
        let public_key = public_key_openssh(&key)?;

        let hostname = config.hostname();
        let authorizer = HttpAuthorizer::new(HttpAuthorizerConfig {
            server_address: config.server_address.clone(),
            tenant_id: config.tenant_id.clone(),
            hostname: hostname.clone(),
            identity: config.preferred_identity.clone(),
            public_key,
            info: DeviceInfo::detect(&hostname),
        })?;

        let options = DialOptions {
            tunnel_address: config.tunnel_address.clone(),
            connect_timeout: config.connect_timeout,
            listener: ListenerOptions {
                keepalive_interval: config.keepalive_interval,
            },
        };
        let dialer: Arc<dyn Dialer> = match config.transport {
            TransportKind::Ssh => Arc::new(SshDialer::new(options, Arc::new(key))),
            TransportKind::Tcp => Arc::new(TcpDialer::new(options)),
        };

        let mut shell = PtyShell::new(config.default_shell.clone(), config.default_env.clone());
        if let Some(hash) = config.single_user_password.as_deref().filter(|p| !p.is_empty()) {
            shell = shell.with_credential(SingleUserCredential::new(hash)?);
        }
        let handler = Arc::new(shell);

        Ok(Self::new(config, Arc::new(authorizer), handler, dialer))
    }

    /// Registry of live sessions
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Run until the device is rejected by the server.
    pub async fn run(self) -> Result<()> {
        let auth = self.initial_authorization().await?;
        self.handler.set_device_name(&auth.device_name);

        let (auth_tx, auth_rx) = watch::channel(auth);

        let router = Arc::new(Router::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
            ProxyConfig {
                local_address: self.config.local_http_address.clone(),
                connect_timeout: self.config.connect_timeout,
            },
        ));
        let supervisor = Supervisor::new(
            Arc::clone(&self.dialer),
            auth_rx,
            router,
            Backoff::from_config(&self.config.backoff),
        );
        let supervisor = tokio::spawn(supervisor.run());

        let refresher = IdentityRefresher::new(
            Arc::clone(&self.authorizer),
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
            auth_tx,
            self.config.refresh_interval,
        );
        let result = refresher.run().await;

        supervisor.abort();
        result.context("Device authorization revoked")
    }

    /// Authorize once before any connection; only transient failures are retried
    async fn initial_authorization(&self) -> Result<AuthContext> {
        let mut backoff = Backoff::from_config(&self.config.backoff);

        loop {
            match self.authorizer.authorize(&[]).await {
                Ok(auth) => {
                    tracing::info!(
                        namespace = %auth.namespace,
                        hostname = %auth.tenant_name,
                        "Device authorized"
                    );
                    return Ok(auth);
                }
                Err(e) if e.is_permanent() => {
                    return Err(e).context("Failed to initialize agent");
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Authorization failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
