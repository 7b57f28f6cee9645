//! Thin HTTP helpers with byte accounting and verbose wire logging.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Request, Response};

use crate::{
    bytes::BytesInfo,
    error::ErrContext,
    events::{Emitter, LogLevel},
};

/// Fixed per-request budget used by every backend call.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client shared by the backend protocol clients.
///
/// Every request and response is tallied into the run's byte counters and,
/// at log level DEBUG and above, traced line by line onto the event stream.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    emitter: Emitter,
    bytes: Arc<BytesInfo>,
}

impl HttpClient {
    pub fn new(emitter: Emitter, bytes: Arc<BytesInfo>, ca_bundle_path: &str) -> Self {
        let client = match build_client(ca_bundle_path) {
            Ok(client) => client,
            Err(err) => {
                emitter.warn(format!("http: falling back to default TLS roots: {err}"));
                Client::builder().build().expect("TLS backend unavailable")
            }
        };
        Self {
            client,
            emitter,
            bytes,
        }
    }

    /// POST `body` as JSON and return the response body.
    ///
    /// The Content-Type header is set only when `body` is nonempty. An HTTP
    /// status of 400 or above is an error, not a successful body.
    pub async fn post_json(
        &self,
        url: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<String, ErrContext> {
        let mut request = self.client.post(url).timeout(timeout);
        if !body.is_empty() {
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }
        self.perform(request, body.len()).await
    }

    /// GET `url` and return the response body.
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<String, ErrContext> {
        self.perform(self.client.get(url).timeout(timeout), 0).await
    }

    async fn perform(
        &self,
        request: reqwest::RequestBuilder,
        body_len: usize,
    ) -> Result<String, ErrContext> {
        let request = request.build().map_err(reqwest_err)?;
        self.trace_request(&request, body_len);
        let response = self.client.execute(request).await.map_err(reqwest_err)?;
        self.trace_response(&response);
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(
                ErrContext::library("reqwest", "", format!("HTTP error status: {status}"))
                    .with_code(i64::from(status.as_u16())),
            );
        }
        let body = response.text().await.map_err(reqwest_err)?;
        self.bytes.add_down(body.len() as u64);
        if !body.is_empty() && self.verbose() {
            self.emitter.debug(format!("http: < data{{{}}}", body.len()));
        }
        Ok(body)
    }

    fn verbose(&self) -> bool {
        self.emitter.log_level() >= LogLevel::Debug
    }

    /// Count the serialized request head and body upward, tracing each
    /// header line when verbose. Bytes are counted exactly once, on the
    /// wire-facing representation.
    fn trace_request(&self, request: &Request, body_len: usize) {
        let verbose = self.verbose();
        let request_line = format!("{} {} HTTP/1.1", request.method(), request.url().path());
        let mut head_size = request_line.len() as u64 + 2;
        if verbose {
            self.emitter.debug(format!("http: > {request_line}"));
        }
        for (name, value) in request.headers() {
            let line = format!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            head_size += line.len() as u64 + 2;
            if verbose {
                self.emitter.debug(format!("http: > {line}"));
            }
        }
        head_size += 2;
        self.bytes.add_up(head_size);
        if body_len > 0 {
            self.bytes.add_up(body_len as u64);
            if verbose {
                self.emitter.debug(format!("http: > data{{{body_len}}}"));
            }
        }
    }

    /// Count the response status line and headers downward; the body is
    /// counted separately once read.
    fn trace_response(&self, response: &Response) {
        let verbose = self.verbose();
        let status_line = format!("HTTP/1.1 {}", response.status());
        let mut head_size = status_line.len() as u64 + 2;
        if verbose {
            self.emitter.debug(format!("http: < {status_line}"));
        }
        for (name, value) in response.headers() {
            let line = format!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            head_size += line.len() as u64 + 2;
            if verbose {
                self.emitter.debug(format!("http: < {line}"));
            }
        }
        head_size += 2;
        self.bytes.add_down(head_size);
    }
}

fn build_client(ca_bundle_path: &str) -> Result<Client, ErrContext> {
    let mut builder = Client::builder();
    if !ca_bundle_path.is_empty() {
        let pem = std::fs::read(ca_bundle_path)
            .map_err(|e| ErrContext::library("std/fs", "", e.to_string()))?;
        let certificates = reqwest::Certificate::from_pem_bundle(&pem).map_err(reqwest_err)?;
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }
    }
    builder.build().map_err(reqwest_err)
}

fn reqwest_err(e: reqwest::Error) -> ErrContext {
    ErrContext::library("reqwest", "", e.to_string())
}
