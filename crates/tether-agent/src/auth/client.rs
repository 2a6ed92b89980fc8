//! HTTP client for the server's device API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use tether_core::traits::Authorizer;
use tether_core::types::{split_host_port, DEFAULT_SSH_PORT};
use tether_core::{AuthContext, AuthError, ServerInfo};

/// Bound for a single API request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Static description of the device sent with every authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Stable machine id
    pub id: String,
    /// Operating system name
    pub pretty_name: String,
    /// Agent version
    pub version: String,
    /// CPU architecture
    pub arch: String,
    /// Runtime platform
    pub platform: String,
}

impl DeviceInfo {
    /// Describe the current machine; `hostname` stands in for a missing machine id
    pub fn detect(hostname: &str) -> Self {
        Self {
            id: machine_id().unwrap_or_else(|| hostname.to_string()),
            pretty_name: os_pretty_name(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            arch: std::env::consts::ARCH.to_string(),
            platform: "native".to_string(),
        }
    }
}

fn machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn os_pretty_name() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|release| parse_pretty_name(&release))
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

fn parse_pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
}

/// Identity hint for the server
#[derive(Debug, Clone, Serialize)]
struct DeviceIdentity {
    mac: String,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    info: &'a DeviceInfo,
    sessions: &'a [String],
    hostname: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<DeviceIdentity>,
    public_key: &'a str,
    tenant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    uid: String,
    token: String,
    name: String,
    namespace: String,
}

/// Settings for [`HttpAuthorizer`]
#[derive(Debug, Clone)]
pub struct HttpAuthorizerConfig {
    /// Server base URL
    pub server_address: String,
    /// Tenant the device registers under
    pub tenant_id: String,
    /// Hostname presented to the server
    pub hostname: String,
    /// Preferred identity hint
    pub identity: Option<String>,
    /// Device public key in OpenSSH format
    pub public_key: String,
    /// Device description
    pub info: DeviceInfo,
}

/// Authorizes the device against the server's HTTP API
pub struct HttpAuthorizer {
    client: reqwest::Client,
    config: HttpAuthorizerConfig,
}

impl HttpAuthorizer {
    /// Create an authorizer
    pub fn new(mut config: HttpAuthorizerConfig) -> Result<Self, AuthError> {
        config.server_address = config.server_address.trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("tether-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AuthError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Fetch public server information
    pub async fn server_info(&self) -> Result<ServerInfo, AuthError> {
        let url = format!("{}/info", self.config.server_address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("GET {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Transient(format!(
                "GET {}: unexpected status {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::Transient(format!("GET {}: invalid body: {}", url, e)))
    }

    /// SSH endpoint advertised by the server, or the API host on the default port
    fn ssh_endpoint(&self, info: &ServerInfo) -> (String, u16) {
        if !info.endpoints.ssh.is_empty() {
            return split_host_port(&info.endpoints.ssh, DEFAULT_SSH_PORT);
        }

        let host = reqwest::Url::parse(&self.config.server_address)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();
        (host, DEFAULT_SSH_PORT)
    }
}

/// Fetch `/info` without device credentials
pub async fn fetch_server_info(server_address: &str) -> Result<ServerInfo, AuthError> {
    HttpAuthorizer::new(HttpAuthorizerConfig {
        server_address: server_address.to_string(),
        tenant_id: String::new(),
        hostname: String::new(),
        identity: None,
        public_key: String::new(),
        info: DeviceInfo::detect(""),
    })?
    .server_info()
    .await
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, sessions: &[String]) -> Result<AuthContext, AuthError> {
        let info = self.server_info().await?;

        let url = format!("{}/api/devices/auth", self.config.server_address);
        let request = AuthRequest {
            info: &self.config.info,
            sessions,
            hostname: &self.config.hostname,
            identity: self
                .config
                .identity
                .clone()
                .filter(|mac| !mac.is_empty())
                .map(|mac| DeviceIdentity { mac }),
            public_key: &self.config.public_key,
            tenant_id: &self.config.tenant_id,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(format!("{}: {}", status, body.trim())));
        }
        if !status.is_success() {
            return Err(AuthError::Transient(format!(
                "POST {}: unexpected status {}",
                url, status
            )));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Transient(format!("POST {}: invalid body: {}", url, e)))?;

        let (ssh_host, ssh_port) = self.ssh_endpoint(&info);
        tracing::debug!("Authorized as {} in namespace {}", auth.uid, auth.namespace);

        Ok(AuthContext {
            uid: auth.uid,
            token: auth.token,
            namespace: auth.namespace,
            tenant_name: auth.name.clone(),
            device_name: auth.name,
            ssh_host,
            ssh_port,
        })
    }
}
