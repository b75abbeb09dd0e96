//! Shared utilities for provider adapter implementations.
//!
//! All adapters (and the JWKS fetcher) send through one tuned
//! [`reqwest::Client`]; the single instance keeps TLS sessions and DNS
//! lookups warm across the many concurrent requests a gateway issues
//! upstream.

use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use lazy_static::lazy_static;

use crate::chatgate::error::{GatewayError, Result};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Send a request, retrying connection failures, 429s and 5xx responses
/// with exponential backoff (1.5^attempt seconds). Any other response is
/// returned to the caller, who owns status interpretation.
pub async fn send_with_retries(
    provider: &str,
    builder: reqwest::RequestBuilder,
    max_retries: u32,
) -> Result<reqwest::Response> {
    let mut attempt = 0;
    loop {
        let request = builder.try_clone().ok_or_else(|| {
            GatewayError::internal("request body is not replayable")
        })?;
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if (status.is_server_error() || status.as_u16() == 429) && attempt < max_retries {
                    log::warn!(
                        "{}: upstream answered {}, retry {}/{}",
                        provider,
                        status,
                        attempt + 1,
                        max_retries
                    );
                } else {
                    return Ok(response);
                }
            }
            Err(e) if attempt < max_retries => {
                log::warn!(
                    "{}: request failed ({}), retry {}/{}",
                    provider,
                    e,
                    attempt + 1,
                    max_retries
                );
            }
            Err(e) => {
                return Err(GatewayError::ProviderUnavailable(format!("{provider}: {e}")));
            }
        }
        attempt += 1;
        tokio::time::sleep(Duration::from_secs_f64(1.5_f64.powi(attempt as i32))).await;
    }
}

/// Map a non-success upstream response to the gateway taxonomy.
pub async fn error_from_response(
    provider: &str,
    model: &str,
    response: reqwest::Response,
) -> GatewayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        404 => GatewayError::ModelNotFound(model.to_string()),
        429 | 500..=599 => {
            GatewayError::ProviderUnavailable(format!("{provider}: {status} {snippet}"))
        }
        _ => GatewayError::Internal(format!("{provider} rejected request: {status} {snippet}")),
    }
}

/// Decode a response body as newline-delimited JSON, yielding one trimmed
/// non-empty line at a time. Lines split across network chunks are
/// reassembled.
pub fn ndjson_lines(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<String>> + Send>> {
    let body = Box::pin(response.bytes_stream());
    Box::pin(futures_util::stream::unfold(
        (body, String::new(), false),
        |(mut body, mut buf, mut finished)| async move {
            loop {
                if let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line), (body, buf, finished)));
                }
                if finished {
                    if buf.trim().is_empty() {
                        return None;
                    }
                    let line = buf.trim().to_string();
                    buf.clear();
                    return Some((Ok(line), (body, buf, finished)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => buf.push_str(&String::from_utf8_lossy(&chunk)),
                    Some(Err(e)) => {
                        finished = true;
                        return Some((
                            Err(GatewayError::ProviderUnavailable(format!(
                                "stream read: {e}"
                            ))),
                            (body, buf, finished),
                        ));
                    }
                    None => finished = true,
                }
            }
        },
    ))
}
