use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use repeater_proto::{ErrorCode, Headers, Protocol, Request, Response};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue as HttpHeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{collect_headers, encode_body, ExecutorError, Failure, RequestExecutor};
use crate::error::code_from_chain;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake headers owned by the websocket client itself.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "content-length",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// WebSocket targets share `--insecure` with HTTP. `--proxy` is not
/// applied to websocket upgrades.
#[derive(Debug, Clone, Default)]
pub struct WsExecutorOptions {
    pub insecure: bool,
}

/// Opens a websocket to the target, sends the body as one text frame and
/// returns the first reply that matches the request's correlation id.
pub struct WsExecutor {
    /// Set only when certificate checks are disabled; `None` uses the
    /// default verifying connector.
    tls: Option<native_tls::TlsConnector>,
}

impl WsExecutor {
    pub fn new(options: WsExecutorOptions) -> Result<Self, ExecutorError> {
        let tls = if options.insecure {
            Some(
                native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self { tls })
    }

    pub fn verifies_certificates(&self) -> bool {
        self.tls.is_none()
    }

    async fn perform(
        &self,
        request: &Request,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Response, Failure> {
        let correlation = Correlation::from_request(request)?;
        let upgrade = build_upgrade(request)?;

        let connector = self.tls.clone().map(Connector::NativeTls);
        let connecting = connect_async_tls_with_config(upgrade, None, false, connector);
        let (mut stream, handshake) = match timeout_at(deadline, connecting).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(tungstenite::Error::Http(rejected))) => {
                let status = rejected.status().as_u16();
                let headers = collect_headers(
                    rejected
                        .headers()
                        .iter()
                        .map(|(name, value)| (name.as_str(), value.as_bytes())),
                );
                let body = rejected.body().as_deref().map(String::from_utf8_lossy);
                return Ok(Response {
                    status_code: Some(status),
                    headers: Some(headers),
                    body: body.map(|body| body.into_owned()),
                    message: Some(format!("websocket upgrade rejected with status {status}")),
                    ..Response::new(Protocol::Ws)
                });
            }
            Ok(Err(err)) => return Err(ws_failure(err)),
            Err(_) => {
                return Err(Failure::new(
                    ErrorCode::TimedOut,
                    format!(
                        "websocket handshake did not finish within {}ms",
                        timeout.as_millis()
                    ),
                ))
            }
        };

        let status = handshake.status().as_u16();
        let headers = collect_headers(
            handshake
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_bytes())),
        );

        if let Some(body) = &request.body {
            stream
                .send(Message::Text(body.clone()))
                .await
                .map_err(ws_failure)?;
        }

        let outcome = timeout_at(
            deadline,
            wait_for_reply(&mut stream, correlation.as_ref(), request),
        )
        .await;
        let _ = tokio::time::timeout(CLOSE_GRACE, stream.close(None)).await;

        let mut response = Response {
            status_code: Some(status),
            headers: Some(headers),
            encoding: request.encoding,
            ..Response::new(Protocol::Ws)
        };
        match outcome {
            Ok(Ok(Some(reply))) => response.body = Some(reply),
            Ok(Ok(None)) => {
                response.message = Some("connection closed before a reply arrived".into());
            }
            Ok(Err(err)) => return Err(ws_failure(err)),
            Err(_) => {
                response.error_code = Some(ErrorCode::TimedOut);
                response.message = Some(format!("no reply within {}ms", timeout.as_millis()));
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl RequestExecutor for WsExecutor {
    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    async fn execute(&self, request: Request, timeout: Duration) -> Response {
        let deadline = Instant::now() + timeout;
        match self.perform(&request, deadline, timeout).await {
            Ok(response) => response,
            Err(failure) => {
                warn!(
                    target: "repeater::executor",
                    url = %request.url,
                    code = %failure.code,
                    error = %failure.message,
                    "websocket request failed"
                );
                failure.into_response(Protocol::Ws)
            }
        }
    }
}

fn build_upgrade(
    request: &Request,
) -> Result<tungstenite::handshake::client::Request, Failure> {
    let mut upgrade = request.url.as_str().into_client_request().map_err(|err| {
        Failure::new(ErrorCode::InvalidUrl, format!("invalid url {}: {err}", request.url))
    })?;
    append_headers(upgrade.headers_mut(), &request.headers)?;
    Ok(upgrade)
}

fn append_headers(
    target: &mut tungstenite::http::HeaderMap,
    headers: &Headers,
) -> Result<(), Failure> {
    for (name, value) in headers {
        if RESERVED_HEADERS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
        {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            Failure::new(
                ErrorCode::Other("ERR_INVALID_HEADER".into()),
                format!("invalid header name {name}"),
            )
        })?;
        for value in value.values() {
            let header_value = HttpHeaderValue::from_str(value).map_err(|_| {
                Failure::new(
                    ErrorCode::Other("ERR_INVALID_HEADER".into()),
                    format!("invalid value for header {name}"),
                )
            })?;
            target.append(header_name.clone(), header_value);
        }
    }
    Ok(())
}

async fn wait_for_reply(
    stream: &mut Stream,
    correlation: Option<&Correlation>,
    request: &Request,
) -> Result<Option<String>, tungstenite::Error> {
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Binary(data) => encode_body(&data, request.encoding()),
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        match correlation {
            Some(correlation) if !correlation.matches(&text) => {
                debug!(
                    target: "repeater::executor",
                    url = %request.url,
                    "skipping uncorrelated websocket frame"
                );
            }
            _ => return Ok(Some(text)),
        }
    }
    Ok(None)
}

/// Pairs a reply with the outgoing frame through a shared identifier
/// extracted by the same pattern from both.
#[derive(Debug)]
struct Correlation {
    pattern: Regex,
    expected: String,
}

impl Correlation {
    fn from_request(request: &Request) -> Result<Option<Self>, Failure> {
        let Some(source) = request.correlation_id_regex.as_deref() else {
            return Ok(None);
        };
        let pattern = Regex::new(source).map_err(|err| {
            Failure::new(
                ErrorCode::Other("ERR_INVALID_CORRELATION_REGEX".into()),
                format!("invalid correlation id pattern: {err}"),
            )
        })?;
        let Some(expected) = request.body.as_deref().and_then(|body| extract(&pattern, body)) else {
            return Ok(None);
        };
        Ok(Some(Self { pattern, expected }))
    }

    fn matches(&self, text: &str) -> bool {
        extract(&self.pattern, text).as_deref() == Some(self.expected.as_str())
    }
}

/// First capture group when the pattern has one, the whole match otherwise.
fn extract(pattern: &Regex, text: &str) -> Option<String> {
    let captures = pattern.captures(text)?;
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|found| found.as_str().to_string())
}

fn ws_failure(err: tungstenite::Error) -> Failure {
    let code = match &err {
        tungstenite::Error::Url(_) => Some(ErrorCode::InvalidUrl),
        tungstenite::Error::Io(io) => crate::error::code_from_io(io),
        other => code_from_chain(other),
    };
    match code {
        Some(code) => Failure::new(code, err.to_string()),
        None => Failure::unclassified(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_prefers_first_group() {
        let grouped = Regex::new(r#""id":\s*"([^"]+)""#).unwrap();
        assert_eq!(
            extract(&grouped, r#"{"id": "abc-1", "op": "get"}"#).as_deref(),
            Some("abc-1")
        );

        let whole = Regex::new(r"req-\d+").unwrap();
        assert_eq!(extract(&whole, "reply for req-42").as_deref(), Some("req-42"));
        assert_eq!(extract(&whole, "nothing here"), None);
    }

    #[test]
    fn correlation_matches_only_same_id() {
        let request = Request::new(Protocol::Ws, "ws://echo.local/socket")
            .with_body(r#"{"id":"7","op":"ping"}"#)
            .with_correlation_id_regex(r#""id":"(\d+)""#);
        let correlation = Correlation::from_request(&request)
            .unwrap()
            .expect("body carries an id");

        assert!(correlation.matches(r#"{"id":"7","op":"pong"}"#));
        assert!(!correlation.matches(r#"{"id":"8","op":"pong"}"#));
        assert!(!correlation.matches("heartbeat"));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let request = Request::new(Protocol::Ws, "ws://echo.local/socket")
            .with_body("x")
            .with_correlation_id_regex("(unclosed");
        let failure = Correlation::from_request(&request).unwrap_err();
        assert_eq!(
            failure.code,
            ErrorCode::Other("ERR_INVALID_CORRELATION_REGEX".into())
        );
    }

    #[test]
    fn reserved_handshake_headers_are_not_forwarded() {
        let request = Request::new(Protocol::Ws, "ws://echo.local/socket")
            .with_header("Sec-WebSocket-Key", "forged")
            .with_header("x-trace", "1");
        let upgrade = build_upgrade(&request).unwrap();
        assert_eq!(
            upgrade.headers().get("x-trace").unwrap().to_str().unwrap(),
            "1"
        );
        assert_ne!(
            upgrade
                .headers()
                .get("sec-websocket-key")
                .map(|value| value.as_bytes()),
            Some(b"forged".as_slice())
        );
    }

    #[test]
    fn insecure_option_disables_certificate_checks() {
        let strict = WsExecutor::new(WsExecutorOptions::default()).unwrap();
        assert!(strict.verifies_certificates());
        let insecure = WsExecutor::new(WsExecutorOptions { insecure: true }).unwrap();
        assert!(!insecure.verifies_certificates());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_an_invalid_url() {
        let response = WsExecutor::new(WsExecutorOptions::default())
            .unwrap()
            .execute(
                Request::new(Protocol::Ws, "ftp://files.local/"),
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(response.error_code, Some(ErrorCode::InvalidUrl));
    }
}
