//! Dispatch of virtual requests
//!
//! Each accepted virtual connection gets its own task, which reads the
//! request head and hands the connection to the matching bridge.

use std::sync::Arc;

use http::StatusCode;

use tether_core::traits::SessionHandler;

use crate::bridge::{self, ProxyConfig};
use crate::http::{Route, VirtualRequest};
use crate::registry::SessionRegistry;
use crate::tunnel::{ReverseListener, TunnelError, VirtualStream};

/// Routes virtual requests to the session and proxy bridges
pub struct Router {
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn SessionHandler>,
    proxy: ProxyConfig,
}

impl Router {
    /// Create a router
    pub fn new(
        registry: Arc<SessionRegistry>,
        handler: Arc<dyn SessionHandler>,
        proxy: ProxyConfig,
    ) -> Self {
        Self {
            registry,
            handler,
            proxy,
        }
    }

    /// Serve every connection accepted on `listener`.
    ///
    /// Returns why the control connection ended. Requests in flight keep
    /// running until their streams end.
    pub async fn serve(self: Arc<Self>, mut listener: ReverseListener) -> TunnelError {
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    let router = Arc::clone(&self);
                    tokio::spawn(async move { router.dispatch(stream).await });
                }
                Err(e) => return e,
            }
        }
    }

    /// Handle one virtual connection to completion
    pub async fn dispatch(&self, stream: VirtualStream) {
        let id = stream.id();
        let remote_addr = stream.remote_addr().to_string();

        let mut request = match VirtualRequest::read_from(stream, remote_addr).await {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Dropping {}: {}", id, e);
                return;
            }
        };
        tracing::debug!(
            "{} {} {} from {}",
            id,
            request.head().method,
            request.head().target,
            request.remote_addr()
        );

        match Route::parse(request.head().path()) {
            Ok(Route::Proxy) => bridge::proxy(request, &self.proxy).await,
            Ok(Route::CloseSession(session)) => {
                bridge::close_session(request, session, Arc::clone(&self.registry)).await
            }
            Ok(Route::OpenSession(session)) => {
                bridge::open_session(
                    request,
                    session,
                    Arc::clone(&self.registry),
                    Arc::clone(&self.handler),
                )
                .await
            }
            Err(e) => {
                tracing::warn!("Unexpected request on {}: {}", id, e);
                let _ = request
                    .respond(StatusCode::NOT_FOUND, "404 page not found")
                    .await;
            }
        }
    }
}
