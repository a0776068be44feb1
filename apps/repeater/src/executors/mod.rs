//! Protocol executors: one per wire protocol, each turning a `Request`
//! into a `Response` within a caller-supplied timeout. Failures never
//! escape an executor; they are folded into `Response.errorCode`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use repeater_proto::{BodyEncoding, ErrorCode, HeaderValue, Headers, Protocol, Request, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::code_from_io;

pub mod http;
pub mod tcp;
pub mod ws;

pub use http::{default_whitelist_mime_types, HttpExecutor, HttpExecutorOptions, DEFAULT_MAX_CONTENT_LENGTH};
pub use tcp::{TcpExecutor, TcpExecutorOptions};
pub use ws::{WsExecutor, WsExecutorOptions};

#[async_trait]
pub trait RequestExecutor: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn execute(&self, request: Request, timeout: Duration) -> Response;
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid proxy url {url}: {reason}")]
    InvalidProxy { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to build websocket tls connector: {0}")]
    Tls(#[from] native_tls::Error),
}

/// Executors indexed by the protocol they serve.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Protocol, Arc<dyn RequestExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP, WebSocket and TCP executors. `http.insecure` also applies to
    /// websocket targets.
    pub fn with_defaults(http: HttpExecutorOptions) -> Result<Self, ExecutorError> {
        let ws = WsExecutorOptions {
            insecure: http.insecure,
        };
        let mut registry = Self::new();
        registry.register(Arc::new(HttpExecutor::new(http)?));
        registry.register(Arc::new(WsExecutor::new(ws)?));
        registry.register(Arc::new(TcpExecutor::new(TcpExecutorOptions::default())));
        Ok(registry)
    }

    /// Registers an executor, replacing any previous one for its protocol.
    pub fn register(&mut self, executor: Arc<dyn RequestExecutor>) {
        self.executors.insert(executor.protocol(), executor);
    }

    pub fn get(&self, protocol: &Protocol) -> Option<Arc<dyn RequestExecutor>> {
        self.executors.get(protocol).cloned()
    }
}

/// A classified executor failure on its way into a `Response`.
#[derive(Debug, Clone)]
pub(crate) struct Failure {
    pub code: ErrorCode,
    pub message: String,
}

impl Failure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Other(UNCLASSIFIED_CODE.into()), message)
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        match code_from_io(err) {
            Some(code) => Self::new(code, err.to_string()),
            None => Self::unclassified(err.to_string()),
        }
    }

    pub fn into_response(self, protocol: Protocol) -> Response {
        Response::error(protocol, self.code, self.message)
    }
}

pub(crate) const UNCLASSIFIED_CODE: &str = "ERR_REQUEST_FAILED";

pub(crate) fn timeout_response(protocol: Protocol, timeout: Duration) -> Response {
    Response::error(
        protocol,
        ErrorCode::TimedOut,
        format!("no response within {}ms", timeout.as_millis()),
    )
}

pub(crate) fn request_body_bytes(request: &Request) -> Result<Vec<u8>, Failure> {
    let Some(body) = request.body.as_deref() else {
        return Ok(Vec::new());
    };
    match request.encoding() {
        BodyEncoding::Utf8 => Ok(body.as_bytes().to_vec()),
        BodyEncoding::Base64 => BASE64.decode(body).map_err(|err| {
            Failure::new(
                ErrorCode::Other("ERR_INVALID_BODY".into()),
                format!("request body is not valid base64: {err}"),
            )
        }),
    }
}

pub(crate) fn encode_body(bytes: &[u8], encoding: BodyEncoding) -> String {
    match encoding {
        BodyEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        BodyEncoding::Base64 => BASE64.encode(bytes),
    }
}

/// Groups repeated header names into a single multi-value entry.
pub(crate) fn collect_headers<'a, I>(pairs: I) -> Headers
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut headers = Headers::new();
    for (name, value) in pairs {
        let value = String::from_utf8_lossy(value).into_owned();
        match headers.get_mut(name) {
            Some(existing) => existing.push(value),
            None => {
                headers.insert(name.to_string(), HeaderValue::Single(value));
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Protocol);

    #[async_trait]
    impl RequestExecutor for Fixed {
        fn protocol(&self) -> Protocol {
            self.0.clone()
        }

        async fn execute(&self, _request: Request, _timeout: Duration) -> Response {
            Response::new(self.0.clone())
        }
    }

    #[test]
    fn registry_replaces_by_protocol() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Fixed(Protocol::Tcp)));
        registry.register(Arc::new(Fixed(Protocol::Tcp)));
        registry.register(Arc::new(Fixed(Protocol::Http)));

        assert_eq!(registry.executors.len(), 2);
        assert!(registry.get(&Protocol::Tcp).is_some());
        assert!(registry.get(&Protocol::Ws).is_none());
        assert!(registry.get(&Protocol::Other("amqp".into())).is_none());
    }

    #[test]
    fn repeated_headers_are_grouped() {
        let headers = collect_headers([
            ("set-cookie", b"a=1".as_slice()),
            ("set-cookie", b"b=2".as_slice()),
            ("content-type", b"text/plain".as_slice()),
        ]);
        assert_eq!(
            headers["set-cookie"],
            HeaderValue::Multiple(vec!["a=1".into(), "b=2".into()])
        );
        assert_eq!(headers["content-type"], HeaderValue::from("text/plain"));
    }

    #[test]
    fn base64_bodies_round_trip_through_helpers() {
        let mut request = Request::new(Protocol::Tcp, "tcp://db.local:5432").with_body("AAEC");
        request.encoding = Some(BodyEncoding::Base64);
        let bytes = request_body_bytes(&request).expect("valid base64");
        assert_eq!(bytes, vec![0, 1, 2]);
        assert_eq!(encode_body(&bytes, BodyEncoding::Base64), "AAEC");

        request.body = Some("***".into());
        assert!(request_body_bytes(&request).is_err());
    }
}
