//! Retrying HTTP transport client.
//!
//! [`TransportClient::execute`] runs one request to completion: connect and
//! read timeouts, header injection, redirect following, and fixed-interval
//! retry on transient failure. It never returns an error; failures are folded
//! into a failed [`ReplyAdapter`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::DEFAULT_MAX_REDIRECTS;
use super::download::download_to_target;
use super::error::TransportError;
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::delivery::ProgressListener;
use crate::reply::{Reply, ReplyAdapter, ReplyBody};
use crate::request::{Method, Request};

const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Single-shot executor of requests with retry and redirect handling.
///
/// Cheap to clone; clones share the connection pools.
#[derive(Debug, Clone)]
pub struct TransportClient {
    default_client: Client,
    default_connect_timeout: Duration,
    max_redirects: u32,
    /// Clients for requests overriding the connect timeout, keyed by timeout in ms.
    by_connect_timeout: Arc<DashMap<u128, Client>>,
}

impl TransportClient {
    /// Creates a client whose default connect timeout is `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ClientBuild`] if reqwest cannot build the client.
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        Self::with_max_redirects(connect_timeout, DEFAULT_MAX_REDIRECTS)
    }

    /// Creates a client with an explicit redirect hop bound.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ClientBuild`] if reqwest cannot build the client.
    pub fn with_max_redirects(
        connect_timeout: Duration,
        max_redirects: u32,
    ) -> Result<Self, TransportError> {
        let default_client = build_client(connect_timeout)?;
        Ok(Self {
            default_client,
            default_connect_timeout: connect_timeout,
            max_redirects,
            by_connect_timeout: Arc::new(DashMap::new()),
        })
    }

    /// Returns the configured redirect bound.
    #[must_use]
    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    /// Executes `request`, retrying transient failures per the request's retry settings.
    #[instrument(skip(self, request, progress), fields(request_id = %request.id(), url = %request.url()))]
    pub async fn execute(
        &self,
        request: &Request,
        progress: Option<Arc<dyn ProgressListener>>,
    ) -> ReplyAdapter {
        let policy = RetryPolicy::for_request(request);
        let client = match self.client_for(request) {
            Ok(client) => client,
            Err(error) => return ReplyAdapter::failed(request.clone(), error, 0),
        };
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if request.is_cancelled() {
                return ReplyAdapter::failed(
                    request.clone(),
                    TransportError::cancelled(request.url()),
                    attempt - 1,
                );
            }
            debug!(attempt, "attempting request");

            match self.attempt(&client, request, progress.as_deref()).await {
                Ok(reply) => {
                    debug!(attempt, status = reply.status, "received reply");
                    return ReplyAdapter::from_reply(request.clone(), reply, attempt);
                }
                Err(error) => match policy.should_retry(classify_error(&error), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next_attempt,
                    } => {
                        info!(
                            attempt = next_attempt,
                            max_attempts = policy.max_attempts(),
                            delay_ms = delay.as_millis(),
                            error = %error,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(%reason, error = %error, "not retrying request");
                        return ReplyAdapter::failed(request.clone(), error, attempt);
                    }
                },
            }
        }
    }

    /// One attempt: follows redirects (bounded on their own) and reads the body.
    async fn attempt(
        &self,
        client: &Client,
        request: &Request,
        progress: Option<&dyn ProgressListener>,
    ) -> Result<Reply, TransportError> {
        let mut current = request.clone();
        let mut hops = 0u32;

        loop {
            let response = send(client, &current).await?;
            let status = response.status().as_u16();

            if request.follow_redirects() && matches!(status, 301 | 302) {
                if hops >= self.max_redirects {
                    return Err(TransportError::TooManyRedirects {
                        url: current.url().to_string(),
                        limit: self.max_redirects,
                    });
                }
                let next = redirect_target(&current, &response)?;
                debug!(from = %current.url(), to = %next, hop = hops + 1, "following redirect");
                current = current.redirected_to(next);
                hops += 1;
                continue;
            }

            return read_reply(response, &current, progress).await;
        }
    }

    fn client_for(&self, request: &Request) -> Result<Client, TransportError> {
        let timeout = request.connect_timeout();
        if timeout == self.default_connect_timeout {
            return Ok(self.default_client.clone());
        }
        if let Some(client) = self.by_connect_timeout.get(&timeout.as_millis()) {
            return Ok(client.clone());
        }
        let client = build_client(timeout)?;
        self.by_connect_timeout
            .insert(timeout.as_millis(), client.clone());
        Ok(client)
    }
}

fn build_client(connect_timeout: Duration) -> Result<Client, TransportError> {
    base_client_builder(connect_timeout)
        .build()
        .map_err(|source| TransportError::ClientBuild { source })
}

fn base_client_builder(connect_timeout: Duration) -> ClientBuilder {
    Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(Policy::none())
        .gzip(true)
        .user_agent(USER_AGENT)
}

async fn send(client: &Client, request: &Request) -> Result<reqwest::Response, TransportError> {
    let url = Url::parse(request.url()).map_err(|_| TransportError::invalid_url(request.url()))?;
    let mut builder = match request.method() {
        Method::Get => client.get(url),
        Method::Head => client.head(url),
        Method::Post => client.post(url),
    };
    builder = builder.timeout(request.read_timeout());

    if request.append_headers() {
        for (name, value) in request.headers() {
            builder = builder.header(name.clone(), value.clone());
        }
    } else {
        builder = builder.headers(request.headers().clone());
    }

    if request.method() == Method::Post
        && let Some(body) = request.body()
    {
        builder = builder.body(body.clone());
    }

    builder
        .send()
        .await
        .map_err(|e| TransportError::network(request.url(), e))
}

fn redirect_target(request: &Request, response: &reqwest::Response) -> Result<String, TransportError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| TransportError::invalid_url(format!("{} (missing Location)", request.url())))?;
    let base = Url::parse(request.url()).map_err(|_| TransportError::invalid_url(request.url()))?;
    base.join(location)
        .map(String::from)
        .map_err(|_| TransportError::invalid_url(location))
}

async fn read_reply(
    response: reqwest::Response,
    request: &Request,
    progress: Option<&dyn ProgressListener>,
) -> Result<Reply, TransportError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let final_url = response.url().to_string();
    let success = (200..300).contains(&status) || status == 304;

    let body = if success && request.method() != Method::Head {
        if let Some(target) = request.download() {
            let outcome = download_to_target(response, request, target, progress).await?;
            ReplyBody::File {
                path: outcome.path,
                bytes: outcome.bytes,
                sha256: outcome.sha256,
            }
        } else if request.streaming() {
            ReplyBody::Stream(Mutex::new(Some(response.bytes_stream().boxed())))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| TransportError::network(request.url(), e))?;
            if let Some(listener) = progress {
                listener.on_progress(request.id(), bytes.len() as u64, Some(bytes.len() as u64));
            }
            ReplyBody::Bytes(bytes)
        }
    } else {
        // Non-OK replies keep whatever body arrived; a broken body is not worth a failure.
        let bytes = response.bytes().await.unwrap_or_else(|e| {
            warn!(url = %request.url(), error = %e, "failed to read error body");
            bytes::Bytes::new()
        });
        ReplyBody::Bytes(bytes)
    };

    Ok(Reply {
        status,
        headers,
        body,
        final_url,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::request::RequestId;
    use crate::reply::ReplyStatus;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn client() -> TransportClient {
        TransportClient::new(Duration::from_secs(5)).unwrap()
    }

    #[derive(Default)]
    struct LastProgress(AtomicU64);

    impl ProgressListener for LastProgress {
        fn on_progress(&self, _request_id: RequestId, bytes_read: u64, _total: Option<u64>) {
            self.0.store(bytes_read, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_execute_buffers_body() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let request = Request::builder(format!("{}/data", server.uri()))
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;

        assert!(adapter.is_ok(), "{:?}", adapter.error());
        assert_eq!(adapter.attempts(), 1);
        assert_eq!(adapter.reply().unwrap().bytes().unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_execute_not_ok_reply_keeps_body() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such thing"))
            .expect(1)
            .mount(&server)
            .await;

        let request = Request::builder(format!("{}/missing", server.uri()))
            .retries(3)
            .retry_interval(Duration::ZERO)
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;

        assert_eq!(adapter.status(), ReplyStatus::Failed);
        assert_eq!(adapter.http_status(), Some(404));
        assert_eq!(
            adapter.reply().unwrap().bytes().unwrap().as_ref(),
            b"no such thing"
        );
    }

    #[tokio::test]
    async fn test_execute_post_sends_body_and_headers() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-api-key", "k1"))
            .and(body_bytes(b"{\"a\":1}".to_vec()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let request = Request::builder(format!("{}/submit", server.uri()))
            .method(Method::Post)
            .header("X-Api-Key", "k1")
            .body(&b"{\"a\":1}"[..])
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;
        assert!(adapter.is_ok(), "{:?}", adapter.error());
        assert_eq!(adapter.http_status(), Some(201));
    }

    #[tokio::test]
    async fn test_execute_follows_redirect() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let request = Request::builder(format!("{}/old", server.uri()))
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;

        assert!(adapter.is_ok());
        let reply = adapter.reply().unwrap();
        assert!(reply.final_url.ends_with("/new"));
        assert_eq!(reply.bytes().unwrap().as_ref(), b"moved");
    }

    #[tokio::test]
    async fn test_execute_redirect_not_followed_when_disabled() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let request = Request::builder(format!("{}/old", server.uri()))
            .follow_redirects(false)
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;
        assert_eq!(adapter.http_status(), Some(302));
        assert!(!adapter.is_ok());
    }

    #[tokio::test]
    async fn test_redirect_loop_bounded_independently_of_retries() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
            .mount(&server)
            .await;

        let request = Request::builder(format!("{}/loop", server.uri()))
            .retries(4)
            .retry_interval(Duration::ZERO)
            .build()
            .unwrap();
        let transport = TransportClient::with_max_redirects(Duration::from_secs(5), 3).unwrap();
        let adapter = transport.execute(&request, None).await;

        assert!(matches!(
            adapter.error().unwrap().as_ref(),
            TransportError::TooManyRedirects { limit: 3, .. }
        ));
        // Redirect exhaustion is permanent: one attempt, four requests (initial + 3 hops).
        assert_eq!(adapter.attempts(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_execute_retries_transient_timeouts() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let request = Request::builder(format!("{}/slow", server.uri()))
            .read_timeout(Duration::from_millis(50))
            .retries(2)
            .retry_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;

        assert!(matches!(
            adapter.error().unwrap().as_ref(),
            TransportError::Timeout { .. }
        ));
        assert_eq!(adapter.attempts(), 3);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_execute_connection_refused_is_retried() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let request = Request::builder(format!("http://127.0.0.1:{port}/gone"))
            .retries(1)
            .retry_interval(Duration::ZERO)
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;

        assert!(adapter.reply().is_none());
        assert!(matches!(
            adapter.error().unwrap().as_ref(),
            TransportError::Network { .. } | TransportError::Timeout { .. }
        ));
        assert_eq!(adapter.attempts(), 2);
    }

    #[tokio::test]
    async fn test_download_mode_writes_file_and_reports_progress() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        let body = vec![7u8; 64 * 1024];
        Mock::given(method("GET"))
            .and(path("/blob.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out").join("blob.bin");
        let request = Request::builder(format!("{}/blob.bin", server.uri()))
            .download_to(&target, None)
            .build()
            .unwrap();
        let progress = Arc::new(LastProgress::default());
        let adapter = client()
            .execute(&request, Some(progress.clone() as Arc<dyn ProgressListener>))
            .await;

        assert!(adapter.is_ok(), "{:?}", adapter.error());
        assert_eq!(std::fs::read(&target).unwrap(), body);
        assert_eq!(progress.0.load(Ordering::SeqCst), body.len() as u64);
        assert!(!super::super::download::partial_path(&target).exists());
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch_discards_file() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/blob.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("blob.bin");
        let request = Request::builder(format!("{}/blob.bin", server.uri()))
            .download_to(&target, Some("00".repeat(32)))
            .retries(2)
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;

        assert!(matches!(
            adapter.error().unwrap().as_ref(),
            TransportError::Integrity { .. }
        ));
        assert!(!target.exists());
        assert!(!super::super::download::partial_path(&target).exists());
    }

    #[tokio::test]
    async fn test_download_checksum_match_commits() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("abc.txt");
        let sha_of_abc = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let request = Request::builder(format!("{}/abc", server.uri()))
            .download_to(&target, Some(sha_of_abc.to_uppercase()))
            .build()
            .unwrap();
        let adapter = client().execute(&request, None).await;

        assert!(adapter.is_ok(), "{:?}", adapter.error());
        match &adapter.reply().unwrap().body {
            ReplyBody::File { sha256, bytes, .. } => {
                assert_eq!(sha256, sha_of_abc);
                assert_eq!(*bytes, 3);
            }
            other => panic!("expected file body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_request_makes_no_attempt() {
        let request = Request::builder("http://127.0.0.1:9/never")
            .build()
            .unwrap();
        request.mark_cancelled();
        let adapter = client().execute(&request, None).await;
        assert!(matches!(
            adapter.error().unwrap().as_ref(),
            TransportError::Cancelled { .. }
        ));
        assert_eq!(adapter.attempts(), 0);
    }
}
