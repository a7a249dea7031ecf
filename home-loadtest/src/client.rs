use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::join_all;
use http_body_util::Full;
use http_test_util::drain::DrainBodyFuture;
use http_test_util::empty_body;
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::params::RequestParams;
use crate::scenario::RequestDescriptor;

const DEFAULT_BODY_CAPACITY: usize = 1024;
const MAX_BODY_PREALLOC: usize = 64 * 1024;

/// Outcome of one request. `status` is 0 when no response arrived.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl HttpResponse {
    fn failed(url: &str, duration: Duration, error: String) -> Self {
        Self {
            url: url.to_string(),
            status: 0,
            headers: HeaderMap::new(),
            body: Vec::new(),
            duration,
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpClient {
    #[must_use]
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }

    /// Issues one request. Transport failures and timeouts come back as a
    /// response with status 0, never as an error.
    pub async fn send(&self, descriptor: &RequestDescriptor, params: &RequestParams) -> HttpResponse {
        let request = match build_request(descriptor, params) {
            Ok(request) => request,
            Err(e) => return HttpResponse::failed(&descriptor.url, Duration::ZERO, format!("{e:#}")),
        };
        let (duration, res) =
            run_timed(tokio::time::timeout(params.timeout, self.send_recv(request))).await;
        match res {
            Ok(Ok((status, headers, body))) => HttpResponse {
                url: descriptor.url.clone(),
                status: status.as_u16(),
                headers,
                body,
                duration,
                error: None,
            },
            Ok(Err(e)) => HttpResponse::failed(&descriptor.url, duration, format!("{e:#}")),
            Err(_) => HttpResponse::failed(
                &descriptor.url,
                duration,
                format!("request timed out after {:?}", params.timeout),
            ),
        }
    }

    /// Issues all requests concurrently and returns once every one has
    /// completed. Responses keep the order of `requests`.
    pub async fn batch(
        &self,
        requests: &[RequestDescriptor],
        params: &RequestParams,
    ) -> Vec<HttpResponse> {
        join_all(requests.iter().map(|descriptor| self.send(descriptor, params))).await
    }

    async fn send_recv(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>)> {
        let resp = self
            .client
            .request(request)
            .await
            .context("Failed to send request")?;
        // Server controlled, only trusted up to the cap
        let content_length: usize = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|hv| hv.to_str().ok())
            .and_then(|hv| hv.parse::<usize>().ok())
            .map_or(DEFAULT_BODY_CAPACITY, |len| len.min(MAX_BODY_PREALLOC));
        let (parts, body) = resp.into_parts();
        let bytes: Vec<u8> = DrainBodyFuture::with_size_hint(body, content_length)
            .await
            .context("Failed to read response body")?;
        Ok((parts.status, parts.headers, bytes))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn build_request(
    descriptor: &RequestDescriptor,
    params: &RequestParams,
) -> Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(descriptor.method.clone())
        .uri(&descriptor.url);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(params.headers.clone());
    }
    builder
        .body(empty_body())
        .with_context(|| format!("Failed to build request for {}", descriptor.url))
}

#[inline]
async fn run_timed<T, F: Future<Output = T>>(fut: F) -> (Duration, T) {
    let start = Instant::now();
    let res = fut.await;
    (start.elapsed(), res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    #[test]
    fn request_carries_params_headers() {
        let mut params = RequestParams::default();
        params.insert_header("Accept", "application/json").unwrap();
        let descriptor = RequestDescriptor {
            method: Method::GET,
            url: "http://app1.localhost/api/v1/home/wishlist/items".to_string(),
        };
        let request = build_request(&descriptor, &params).unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().host(), Some("app1.localhost"));
        assert_eq!(request.headers().get("accept").unwrap(), "application/json");
    }

    #[test]
    fn malformed_url_fails_to_build() {
        let descriptor = RequestDescriptor {
            method: Method::GET,
            url: "http://exa mple/".to_string(),
        };
        assert!(build_request(&descriptor, &RequestParams::default()).is_err());
    }

    #[tokio::test]
    async fn unreachable_origin_yields_status_zero() {
        // Port 1 on loopback is closed on any sane test host.
        let descriptor = RequestDescriptor {
            method: Method::GET,
            url: "http://127.0.0.1:1/api/v1/home/wishlist/items".to_string(),
        };
        let response = HttpClient::new()
            .send(&descriptor, &RequestParams::default())
            .await;
        assert_eq!(response.status, 0);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn oversized_content_length_is_a_failed_request() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 9223372036854775000\r\n\r\nabc")
                .await
                .unwrap();
        });

        let descriptor = RequestDescriptor {
            method: Method::GET,
            url: format!("http://{addr}/api/v1/home/wishlist/items"),
        };
        let response = HttpClient::new()
            .send(&descriptor, &RequestParams::default())
            .await;
        assert_eq!(response.status, 0);
        assert!(response.error.is_some());
    }
}
