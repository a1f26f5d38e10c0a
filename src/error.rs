//! Error taxonomy and client-facing error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Conditions the engine surfaces to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyError {
    /// Missing, empty or malformed Host header
    MissingHost,
    /// No site configured for the requested host
    UnknownHost,
    /// Upstream DNS failure, connect failure or timeout
    UpstreamUnreachable,
    /// Upstream read/write failure before any response byte reached the client
    UpstreamFailed,
}

impl ProxyError {
    /// HTTP status presented to the client
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingHost => StatusCode::BAD_REQUEST,
            ProxyError::UnknownHost => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnreachable => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamFailed => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Build a plain-text error response
///
/// Every engine-originated response carries `Content-Type: text/plain` and a
/// `Server: <name>/<version>` header. The connection is closed after the
/// response is written.
pub fn error_response(
    error: ProxyError,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body: String = message.into();

    Response::builder()
        .status(error.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .header(hyper::header::SERVER, server_token())
        .header(hyper::header::CONNECTION, "close")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// `Server` header value, e.g. `hostgate/0.1.0`
pub fn server_token() -> String {
    format!("{}/{}", PKG_NAME, VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::MissingHost.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyError::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::UpstreamFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(ProxyError::UnknownHost, "No site configured for host");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(
            response.headers().get(hyper::header::CONNECTION).unwrap(),
            "close"
        );

        let server = response
            .headers()
            .get(hyper::header::SERVER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(server.starts_with("hostgate/"));
    }
}
