//! Device authorization against the server

mod client;
mod keys;
mod refresh;

pub use client::{fetch_server_info, DeviceInfo, HttpAuthorizer, HttpAuthorizerConfig};
pub use keys::{ensure_device_key, load_device_key, public_key_openssh};
pub use refresh::IdentityRefresher;
