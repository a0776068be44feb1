use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use repeater_proto::{ErrorCode, Protocol, Request, Response};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    collect_headers, encode_body, request_body_bytes, timeout_response, ExecutorError, Failure,
    RequestExecutor,
};
use crate::error::code_from_reqwest;

pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 100 * 1024;

/// MIME types whose bodies are always returned in full.
pub fn default_whitelist_mime_types() -> Vec<String> {
    [
        "text/html",
        "text/plain",
        "text/css",
        "text/javascript",
        "text/xml",
        "application/javascript",
        "application/x-javascript",
        "application/json",
        "application/xml",
        "application/x-www-form-urlencoded",
        "application/graphql",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone)]
pub struct HttpExecutorOptions {
    pub proxy: Option<String>,
    /// Accept invalid or self-signed certificates from targets.
    pub insecure: bool,
    /// Bodies of non-whitelisted types are truncated to this many bytes.
    pub max_content_length: usize,
    pub whitelist_mime_types: Vec<String>,
}

impl Default for HttpExecutorOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            insecure: false,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            whitelist_mime_types: default_whitelist_mime_types(),
        }
    }
}

pub struct HttpExecutor {
    client: reqwest::Client,
    options: HttpExecutorOptions,
}

impl HttpExecutor {
    pub fn new(options: HttpExecutorOptions) -> Result<Self, ExecutorError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(options.insecure)
            .gzip(true)
            .brotli(true);
        if let Some(proxy) = &options.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|err| {
                ExecutorError::InvalidProxy {
                    url: proxy.clone(),
                    reason: err.to_string(),
                }
            })?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        Ok(Self {
            client: builder.build()?,
            options,
        })
    }

    fn is_whitelisted(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.options
            .whitelist_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&essence))
    }

    async fn perform(&self, request: &Request) -> Result<Response, Failure> {
        let url = Url::parse(&request.url).map_err(|err| {
            Failure::new(ErrorCode::InvalidUrl, format!("invalid url {}: {err}", request.url))
        })?;
        let method_name = request.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            Failure::new(
                ErrorCode::Other("ERR_INVALID_METHOD".into()),
                format!("invalid http method {method_name}"),
            )
        })?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            for value in value.values() {
                builder = builder.header(name.as_str(), value);
            }
        }
        let body = request_body_bytes(request)?;
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(reqwest_failure)?;
        let status = response.status().as_u16();
        let headers = collect_headers(
            response
                .headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_bytes())),
        );
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let limit = (!self.is_whitelisted(content_type.as_deref()))
            .then_some(self.options.max_content_length);

        let mut bytes = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(reqwest_failure)? {
            bytes.extend_from_slice(&chunk);
            if let Some(limit) = limit {
                if bytes.len() >= limit {
                    truncated = bytes.len() > limit;
                    bytes.truncate(limit);
                    break;
                }
            }
        }
        if truncated {
            debug!(
                target: "repeater::executor",
                url = %request.url,
                content_type = content_type.as_deref().unwrap_or("unknown"),
                limit = self.options.max_content_length,
                "truncated response body"
            );
        }

        Ok(Response {
            status_code: Some(status),
            headers: Some(headers),
            body: Some(encode_body(&bytes, request.encoding())),
            encoding: request.encoding,
            message: truncated.then(|| {
                format!(
                    "response body truncated to {} bytes",
                    self.options.max_content_length
                )
            }),
            ..Response::new(Protocol::Http)
        })
    }
}

fn reqwest_failure(err: reqwest::Error) -> Failure {
    match code_from_reqwest(&err) {
        Some(code) => Failure::new(code, err.to_string()),
        None => Failure::unclassified(err.to_string()),
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn execute(&self, request: Request, timeout: Duration) -> Response {
        match tokio::time::timeout(timeout, self.perform(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(failure)) => {
                warn!(
                    target: "repeater::executor",
                    url = %request.url,
                    code = %failure.code,
                    error = %failure.message,
                    "http request failed"
                );
                failure.into_response(Protocol::Http)
            }
            Err(_) => {
                warn!(
                    target: "repeater::executor",
                    url = %request.url,
                    timeout_ms = timeout.as_millis() as u64,
                    "http request timed out"
                );
                timeout_response(Protocol::Http, timeout)
            }
        }
    }
}
