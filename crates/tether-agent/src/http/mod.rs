//! HTTP/1.x handling for virtual connections

mod request;
mod route;

pub use request::{HijackError, RawStream, RequestError, RequestHead, VirtualRequest, MAX_HEAD_SIZE};
pub use route::{Route, RouteError};
