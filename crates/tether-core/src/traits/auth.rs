//! Authorization trait

use async_trait::async_trait;

use crate::error::AuthError;
use crate::types::AuthContext;

/// (Re-)authenticates the device against the management server
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Authorize the device.
    ///
    /// `sessions` holds the ids of the sessions the device still considers
    /// live, so the server can reconcile its own view.
    async fn authorize(&self, sessions: &[String]) -> Result<AuthContext, AuthError>;
}
