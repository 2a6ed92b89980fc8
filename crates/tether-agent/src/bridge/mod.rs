//! Bridges between virtual connections and device-side consumers

mod proxy;
mod session;

pub use proxy::{proxy, ProxyConfig, ProxyError, X_NAMESPACE, X_PATH};
pub use session::{close_session, open_session};
