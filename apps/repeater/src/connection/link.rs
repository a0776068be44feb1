use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use repeater_proto::{ErrorCode, Frame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::ConnectionError;
use crate::error::{code_from_chain, code_from_io};

pub const DOMAIN_HEADER: &str = "x-repeater-domain";

/// One live frame stream to the controller. Dropping it tears the
/// underlying transport down.
pub struct Link {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            task,
        }
    }

    /// In-process link; the returned peer plays the controller.
    pub fn memory() -> (Link, MemoryPeer) {
        let (to_peer, from_link) = mpsc::unbounded_channel();
        let (to_link, from_peer) = mpsc::unbounded_channel();
        (
            Link::new(to_peer, from_peer, None),
            MemoryPeer {
                outbound: to_link,
                inbound: from_link,
            },
        )
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.outbound.clone()
    }

    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::LinkClosed)
    }

    /// Next frame from the controller; `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    pub fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Controller side of [`Link::memory`].
pub struct MemoryPeer {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Next frame that is not a heartbeat.
    pub async fn recv_event(&mut self) -> Option<Frame> {
        loop {
            match self.inbound.recv().await? {
                Frame::Ping | Frame::Pong => continue,
                frame => return Some(frame),
            }
        }
    }
}

/// Opens links to the controller.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Link, ConnectionError>;
}

/// Dials the controller's websocket endpoint with bearer credentials and
/// the machine's hostname as the domain claim.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
    token: String,
    domain: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>, token: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            domain: domain.into(),
        }
    }

    fn upgrade_request(
        &self,
    ) -> Result<tungstenite::handshake::client::Request, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidUrl {
            url: self.url.clone(),
            reason,
        };
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| invalid(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| ConnectionError::InvalidCredentials("token"))?;
        let domain = HeaderValue::from_str(&self.domain)
            .map_err(|_| ConnectionError::InvalidCredentials("hostname"))?;
        let headers = request.headers_mut();
        headers.insert(tungstenite::http::header::AUTHORIZATION, bearer);
        headers.insert(DOMAIN_HEADER, domain);
        Ok(request)
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<Link, ConnectionError> {
        let request = self.upgrade_request()?;
        debug!(target: "repeater::connection", url = %self.url, "dialing controller");
        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| dial_error(&self.url, err))?;

        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(stream, rx_out, tx_in));
        Ok(Link::new(tx_out, rx_in, Some(task)))
    }
}

fn dial_error(url: &str, err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                ConnectionError::Unauthorized(status)
            } else {
                ConnectionError::Rejected(status)
            }
        }
        tungstenite::Error::Url(reason) => ConnectionError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        },
        tungstenite::Error::Io(io) => ConnectionError::Transport {
            code: code_from_io(&io),
            message: io.to_string(),
        },
        other => ConnectionError::Transport {
            code: code_from_chain(&other),
            message: other.to_string(),
        },
    }
}

/// Moves frames between the socket and the link's channels until either
/// side goes away.
async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<Frame>,
    tx_in: mpsc::UnboundedSender<Frame>,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            outgoing = rx_out.recv() => {
                let Some(frame) = outgoing else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "repeater::connection", error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if tx_in.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(target: "repeater::connection", error = %err, "dropping malformed frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(target: "repeater::connection", "controller socket closed");
}

/// Hands out queued links or failures in order. Once the queue is empty
/// every dial is refused.
#[derive(Default)]
pub struct MemoryDialer {
    queue: Mutex<VecDeque<Result<Link, ConnectionError>>>,
    attempts: AtomicUsize,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful dial and returns the controller side of it.
    pub fn push_link(&self) -> MemoryPeer {
        let (link, peer) = Link::memory();
        self.queue.lock().push_back(Ok(link));
        peer
    }

    pub fn push_error(&self, err: ConnectionError) {
        self.queue.lock().push_back(Err(err));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Link, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().pop_front();
        next.unwrap_or_else(|| {
            Err(ConnectionError::Transport {
                code: Some(ErrorCode::ConnectionRefused),
                message: "connect ECONNREFUSED".to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_link_carries_frames_both_ways() {
        let (mut link, mut peer) = Link::memory();
        link.send(Frame::Ping).unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Ping));

        assert!(peer.send(Frame::Pong));
        assert_eq!(link.recv().await, Some(Frame::Pong));

        drop(peer);
        assert_eq!(link.recv().await, None);
        assert!(matches!(link.send(Frame::Ping), Err(ConnectionError::LinkClosed)));
    }

    #[test]
    fn upgrade_carries_credentials_and_domain() {
        let dialer = WebSocketDialer::new(
            "wss://cluster.example/api/v1/repeaters/socket",
            "s3cret",
            "build-01",
        );
        let request = dialer.upgrade_request().unwrap();
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer s3cret"
        );
        assert_eq!(request.headers()["x-repeater-domain"].to_str().unwrap(), "build-01");
    }

    #[test]
    fn auth_failures_are_classified_from_upgrade_status() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        assert!(matches!(
            dial_error("wss://cluster.example/", tungstenite::Error::Http(response)),
            ConnectionError::Unauthorized(401)
        ));
    }

    #[tokio::test]
    async fn memory_dialer_replays_queue_then_refuses() {
        let dialer = MemoryDialer::new();
        dialer.push_error(ConnectionError::Rejected(503));
        let _peer = dialer.push_link();

        assert!(matches!(dialer.dial().await, Err(ConnectionError::Rejected(503))));
        assert!(dialer.dial().await.is_ok());
        assert!(matches!(
            dialer.dial().await,
            Err(ConnectionError::Transport { code: Some(ErrorCode::ConnectionRefused), .. })
        ));
        assert_eq!(dialer.attempts(), 3);
    }
}
