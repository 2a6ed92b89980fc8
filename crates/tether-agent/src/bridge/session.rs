//! Raw stream bridge for interactive sessions

use std::sync::Arc;

use http::StatusCode;

use tether_core::traits::SessionHandler;

use crate::http::VirtualRequest;
use crate::registry::{Session, SessionRegistry};
use crate::tunnel::{StreamHandle, VirtualStream};

/// Closes the stream and unregisters the session on every exit path
struct SessionGuard<'a> {
    registry: &'a SessionRegistry,
    id: &'a str,
    handle: StreamHandle,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.handle.shutdown();
        if self.registry.remove_if_current(self.id, &self.handle) {
            tracing::debug!("Session {} unregistered", self.id);
        }
    }
}

/// Hijack the connection and hand it to the session subsystem.
///
/// Returns once the session ends.
pub async fn open_session(
    mut request: VirtualRequest<VirtualStream>,
    id: String,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn SessionHandler>,
) {
    let raw = match request.hijack() {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("Failed to hijack connection for session {}: {}", id, e);
            let _ = request
                .respond(StatusCode::INTERNAL_SERVER_ERROR, "failed to hijack connection")
                .await;
            return;
        }
    };
    let handle = raw.get_ref().handle();

    if let Err(e) = registry.put(Session::new(id.clone(), handle.clone())) {
        tracing::warn!("Refusing session: {}", e);
        handle.shutdown();
        return;
    }

    let _guard = SessionGuard {
        registry: &registry,
        id: &id,
        handle,
    };

    tracing::info!("Session {} opened from {}", id, request.remote_addr());
    match handler.handle(Box::new(raw), &id).await {
        Ok(()) => tracing::info!("Session {} ended", id),
        Err(e) => tracing::warn!("Session {} ended with error: {:#}", id, e),
    }
}

/// Drop a live session on request of the server. Idempotent.
pub async fn close_session(
    mut request: VirtualRequest<VirtualStream>,
    id: String,
    registry: Arc<SessionRegistry>,
) {
    match registry.remove(&id) {
        Some(session) => {
            session.handle.shutdown();
            tracing::info!("Session {} closed by server", id);
        }
        None => tracing::debug!("Close for unknown session {}", id),
    }

    if let Err(e) = request.respond(StatusCode::OK, "").await {
        tracing::debug!("Failed to acknowledge close of {}: {}", id, e);
    }
}
