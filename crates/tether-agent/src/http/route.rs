//! Routing of virtual requests

use thiserror::Error;

/// Path prefix shared by all routes
const PREFIX: &str = "/ssh/";

/// What a virtual request asks the device to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Forward the request to the local HTTP service
    Proxy,
    /// Close the live session with this id
    CloseSession(String),
    /// Serve a new interactive session with this id
    OpenSession(String),
}

/// The request path matches no route
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no route for {0}")]
pub struct RouteError(pub String);

impl Route {
    /// Match a request path (without query).
    ///
    /// `/ssh/http` takes precedence over a session named `http`.
    pub fn parse(path: &str) -> Result<Self, RouteError> {
        let not_found = || RouteError(path.to_string());
        let rest = path.strip_prefix(PREFIX).ok_or_else(not_found)?;

        if rest == "http" {
            return Ok(Route::Proxy);
        }
        if let Some(id) = rest.strip_prefix("close/") {
            return single_segment(id)
                .map(|id| Route::CloseSession(id.to_string()))
                .ok_or_else(not_found);
        }
        single_segment(rest)
            .map(|id| Route::OpenSession(id.to_string()))
            .ok_or_else(not_found)
    }
}

fn single_segment(s: &str) -> Option<&str> {
    (!s.is_empty() && !s.contains('/')).then_some(s)
}
