use async_trait::async_trait;
use repeater_proto::{ErrorCode, Protocol, Request, Response};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::warn;
use url::Url;

use super::{encode_body, request_body_bytes, Failure, RequestExecutor};

#[derive(Debug, Clone)]
pub struct TcpExecutorOptions {
    /// Once bytes have arrived, this much silence ends the reply.
    pub idle_timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for TcpExecutorOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1),
            max_response_bytes: 1024 * 1024,
        }
    }
}

/// Raw TCP exchange against `tcp://host:port`: write the body, then read
/// until the peer closes, goes idle, or the deadline passes.
#[derive(Debug, Default)]
pub struct TcpExecutor {
    options: TcpExecutorOptions,
}

impl TcpExecutor {
    pub fn new(options: TcpExecutorOptions) -> Self {
        Self { options }
    }

    async fn perform(
        &self,
        request: &Request,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Response, Failure> {
        let (host, port) = target_address(&request.url)?;
        let payload = request_body_bytes(request)?;

        let mut stream = match timeout_at(deadline, TcpStream::connect((host.as_str(), port))).await {
            Ok(connected) => connected.map_err(|err| Failure::from_io(&err))?,
            Err(_) => {
                return Err(Failure::new(
                    ErrorCode::TimedOut,
                    format!("connect to {host}:{port} timed out after {}ms", timeout.as_millis()),
                ))
            }
        };
        if !payload.is_empty() {
            match timeout_at(deadline, stream.write_all(&payload)).await {
                Ok(written) => written.map_err(|err| Failure::from_io(&err))?,
                Err(_) => {
                    return Err(Failure::new(
                        ErrorCode::TimedOut,
                        format!("write to {host}:{port} timed out"),
                    ))
                }
            }
        }

        let mut received = Vec::new();
        let mut buf = [0u8; 8192];
        let mut timed_out = false;
        loop {
            let read_deadline = if received.is_empty() {
                deadline
            } else {
                deadline.min(Instant::now() + self.options.idle_timeout)
            };
            match timeout_at(read_deadline, stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(read)) => {
                    received.extend_from_slice(&buf[..read]);
                    if received.len() >= self.options.max_response_bytes {
                        received.truncate(self.options.max_response_bytes);
                        break;
                    }
                }
                Ok(Err(err)) if received.is_empty() => return Err(Failure::from_io(&err)),
                Ok(Err(_)) => break,
                Err(_) if read_deadline < deadline => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }
        let _ = stream.shutdown().await;

        let mut response = Response {
            body: Some(encode_body(&received, request.encoding())),
            encoding: request.encoding,
            ..Response::new(Protocol::Tcp)
        };
        if timed_out {
            response.error_code = Some(ErrorCode::TimedOut);
            response.message = Some(format!(
                "read from {host}:{port} timed out after {}ms",
                timeout.as_millis()
            ));
        }
        Ok(response)
    }
}

fn target_address(raw: &str) -> Result<(String, u16), Failure> {
    let url = Url::parse(raw)
        .map_err(|err| Failure::new(ErrorCode::InvalidUrl, format!("invalid url {raw}: {err}")))?;
    if url.scheme() != "tcp" {
        return Err(Failure::new(
            ErrorCode::UnsupportedProtocol,
            format!("expected a tcp:// url, got {}", url.scheme()),
        ));
    }
    let host = url
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| Failure::new(ErrorCode::InvalidUrl, format!("{raw} has no host")))?;
    let port = url
        .port()
        .ok_or_else(|| Failure::new(ErrorCode::InvalidUrl, format!("{raw} has no port")))?;
    Ok((host, port))
}

#[async_trait]
impl RequestExecutor for TcpExecutor {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
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
                    "tcp request failed"
                );
                failure.into_response(Protocol::Tcp)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parses_tcp_targets() {
        assert_eq!(
            target_address("tcp://db.internal:5432").unwrap(),
            ("db.internal".to_string(), 5432)
        );
        assert_eq!(
            target_address("tcp://[::1]:7000").unwrap(),
            ("::1".to_string(), 7000)
        );
        assert_eq!(
            target_address("tcp://db.internal").unwrap_err().code,
            ErrorCode::InvalidUrl
        );
        assert_eq!(
            target_address("udp://db.internal:53").unwrap_err().code,
            ErrorCode::UnsupportedProtocol
        );
    }

    #[tokio::test]
    async fn echoes_until_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let read = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"echo:").await.unwrap();
            socket.write_all(&buf[..read]).await.unwrap();
        });

        let response = TcpExecutor::default()
            .execute(
                Request::new(Protocol::Tcp, format!("tcp://{addr}")).with_body("hello"),
                Duration::from_secs(5),
            )
            .await;
        assert!(!response.is_error(), "{response:?}");
        assert_eq!(response.body.as_deref(), Some("echo:hello"));
    }

    #[tokio::test]
    async fn silent_peer_times_out_with_empty_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let response = TcpExecutor::default()
            .execute(
                Request::new(Protocol::Tcp, format!("tcp://{addr}")).with_body("ping"),
                Duration::from_millis(200),
            )
            .await;
        assert_eq!(response.error_code, Some(ErrorCode::TimedOut));
        assert_eq!(response.body.as_deref(), Some(""));
        server.abort();
    }
}
