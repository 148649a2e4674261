//! HTTP request manager.
//!
//! Requests are enqueued with a completion callback and driven over the
//! loop's own reactor: DNS on the blocking pool, a nonblocking connect,
//! then an HTTP/1.1 exchange with `Connection: close`. Each request runs
//! as an internal fiber; completions are batched and their callbacks fire
//! from `drive()`, once per loop iteration. Requests are cancellable by id
//! and a per-request timeout surfaces as [`Error::Timeout`].

mod response;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use smart_default::SmartDefault;
use url::Url;

use crate::error::{Error, Result};
use crate::promise::{CancellablePromise, Promise, Settler};
use crate::runtime::net::{RaceAgainst, connect, timed, write_all};
use crate::runtime::tick::run_guarded;
use crate::runtime::{Handle, TimerHandle};

pub use response::{Headers, HttpResponse};

/// Opaque request identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

/// Streaming body sink: receives each body fragment as it arrives.
pub type WriteCallback = Box<dyn FnMut(&[u8])>;

/// Per-header hook: `(name, value)`, once per parsed response header.
pub type HeaderCallback = Box<dyn FnMut(&str, &str)>;

/// Progress hook: body bytes received so far, and the Content-Length
/// total when the response declared one.
pub type ProgressCallback = Box<dyn FnMut(u64, Option<u64>)>;

/// Per-request options. Closed set: unknown knobs do not exist.
#[derive(SmartDefault)]
pub struct HttpOptions {
    pub method: Method,

    /// Extra request headers, sent in order; duplicates allowed.
    pub headers: Vec<(String, String)>,

    pub body: Vec<u8>,

    /// Overall deadline for the exchange.
    pub timeout: Option<Duration>,

    /// Deadline for DNS + TCP connect.
    #[default(Some(Duration::from_secs(30)))]
    pub connect_timeout: Option<Duration>,

    /// Recognized for interface parity; this client refuses `https` URLs
    /// outright, so there is no certificate check to skip.
    #[default = true]
    pub verify_tls: bool,

    #[default = true]
    pub follow_redirects: bool,

    #[default = 10]
    pub max_redirects: usize,

    #[default("weft/0.1".to_string())]
    pub user_agent: String,

    /// Streaming sink for body fragments (decoded for chunked bodies).
    /// When set, the completed response's `body` is left empty. Fires for
    /// every response in a redirect chain.
    pub write_callback: Option<WriteCallback>,

    /// Fired once per response header, before any body delivery.
    pub header_callback: Option<HeaderCallback>,

    /// Fired after each body read during the body phase.
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for HttpOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOptions")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("verify_tls", &self.verify_tls)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("user_agent", &self.user_agent)
            .field("write_callback", &self.write_callback.is_some())
            .field("header_callback", &self.header_callback.is_some())
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

type HttpCallback = Box<dyn FnOnce(Result<HttpResponse>)>;

struct InFlight {
    callback: HttpCallback,
    cancel: CancellablePromise<()>,
    // Keeps the cancel promise pending until the request finishes.
    _cancel_settler: Settler<()>,
    timer: Option<TimerHandle>,
    task_id: usize,
}

#[derive(Default)]
pub(crate) struct HttpManager {
    requests: HashMap<RequestId, InFlight>,
    ready: VecDeque<(RequestId, Result<HttpResponse>)>,
    next_id: u64,
}

impl HttpManager {
    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.ready.is_empty()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn clear(&mut self) {
        self.requests.clear();
        self.ready.clear();
    }
}

impl Handle {
    /// Enqueue an HTTP request; `callback` fires exactly once with the
    /// outcome unless the request is cancelled first.
    pub fn http_request(
        &self,
        url: &str,
        options: HttpOptions,
        callback: impl FnOnce(Result<HttpResponse>) + 'static,
    ) -> Result<RequestId> {
        let url = Url::parse(url).map_err(|e| Error::Http(format!("invalid URL: {}", e)))?;
        if url.scheme() != "http" {
            return Err(Error::Unsupported(format!(
                "URL scheme '{}' (TLS handshakes are out of scope)",
                url.scheme()
            )));
        }

        let id = {
            let mut manager = self.shared().http.borrow_mut();
            let id = RequestId(manager.next_id);
            manager.next_id += 1;
            id
        };

        let (cancel, cancel_settler) = CancellablePromise::pending_on(self);
        let timeout = options.timeout;

        let (outcome, task_id) =
            self.spawn_tracked(perform(self.clone(), url, options, cancel.promise()));

        let watcher = self.clone();
        outcome.on_settle(move |result| {
            let mut manager = watcher.shared().http.borrow_mut();
            if manager.requests.contains_key(&id) {
                manager.ready.push_back((id, result));
            }
        });

        let timer = timeout.map(|delay| {
            let on_deadline = self.clone();
            self.set_timeout(delay, move || {
                let mut manager = on_deadline.shared().http.borrow_mut();
                if manager.requests.contains_key(&id) {
                    manager.ready.push_back((id, Err(Error::Timeout)));
                }
            })
        });

        self.shared().http.borrow_mut().requests.insert(
            id,
            InFlight {
                callback: Box::new(callback),
                cancel,
                _cancel_settler: cancel_settler,
                timer,
                task_id,
            },
        );
        tracing::debug!(%id, "http request enqueued");
        Ok(id)
    }

    /// Remove an in-flight request. Its socket is dropped, its watchers
    /// unwound, and its callback never fires. Returns `false` if the
    /// request already completed.
    pub fn http_cancel(&self, id: RequestId) -> bool {
        let inflight = self.shared().http.borrow_mut().requests.remove(&id);
        let Some(inflight) = inflight else {
            return false;
        };
        if let Some(timer) = &inflight.timer {
            timer.cancel();
        }
        inflight.cancel.cancel();
        self.cancel_fiber(inflight.task_id);
        tracing::debug!(%id, "http request cancelled");
        true
    }

    /// Number of requests currently in flight.
    pub fn http_in_flight(&self) -> usize {
        self.shared().http.borrow().in_flight()
    }
}

/// Fire completion callbacks for every finished request. Returns whether
/// any ran. Called once per loop iteration.
pub(crate) fn drive(handle: &Handle) -> bool {
    let completed: Vec<(RequestId, InFlight, Result<HttpResponse>)> = {
        let mut manager = handle.shared().http.borrow_mut();
        let mut batch = Vec::new();
        while let Some((id, outcome)) = manager.ready.pop_front() {
            // A request can queue two outcomes (completion racing a
            // timeout); the first one wins, the duplicate is dropped here.
            if let Some(inflight) = manager.requests.remove(&id) {
                batch.push((id, inflight, outcome));
            }
        }
        batch
    };

    let any = !completed.is_empty();
    for (id, mut inflight, outcome) in completed {
        if let Some(timer) = inflight.timer.take() {
            timer.cancel();
        }
        // On the timeout path the fiber is still alive; detach it.
        handle.cancel_fiber(inflight.task_id);
        tracing::debug!(%id, ok = outcome.is_ok(), "http request completed");
        let callback = inflight.callback;
        run_guarded(Box::new(move || callback(outcome)));
    }
    any
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

async fn perform(
    handle: Handle,
    url: Url,
    mut options: HttpOptions,
    cancel: Promise<()>,
) -> Result<HttpResponse> {
    let mut current = url;
    let mut hops = 0usize;
    loop {
        let response = fetch_once(&handle, &current, &mut options, &cancel).await?;
        if options.follow_redirects && is_redirect(response.status) {
            if hops >= options.max_redirects {
                return Err(Error::Http("too many redirects".into()));
            }
            if let Some(location) = response.headers.get("location") {
                current = current
                    .join(location)
                    .map_err(|e| Error::Http(format!("bad redirect location: {}", e)))?;
                if current.scheme() != "http" {
                    return Err(Error::Unsupported(
                        "redirect to a non-http URL (TLS handshakes are out of scope)".into(),
                    ));
                }
                hops += 1;
                continue;
            }
        }
        return Ok(response);
    }
}

async fn fetch_once(
    handle: &Handle,
    url: &Url,
    options: &mut HttpOptions,
    cancel: &Promise<()>,
) -> Result<HttpResponse> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Http("URL has no host".into()))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let stream = RaceAgainst {
        signal: cancel.clone(),
        error: Error::Cancelled,
        fut: timed(handle, options.connect_timeout, connect(handle, host, port, true)),
    }
    .await?;

    let request = encode_request(url, options, host, port);
    RaceAgainst {
        signal: cancel.clone(),
        error: Error::Cancelled,
        fut: write_all(handle, &stream, &request),
    }
    .await?;

    RaceAgainst {
        signal: cancel.clone(),
        error: Error::Cancelled,
        fut: response::read_response(handle, &stream, options),
    }
    .await
}

fn encode_request(url: &Url, options: &HttpOptions, host: &str, port: u16) -> Vec<u8> {
    let mut target = String::from(url.path());
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut head = format!("{} {} HTTP/1.1\r\n", options.method.as_str(), target);
    if port == 80 {
        head.push_str(&format!("Host: {}\r\n", host));
    } else {
        head.push_str(&format!("Host: {}:{}\r\n", host, port));
    }
    head.push_str("Connection: close\r\n");

    let has = |name: &str| {
        options
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    };
    if !has("user-agent") {
        head.push_str(&format!("User-Agent: {}\r\n", options.user_agent));
    }
    if !has("accept") {
        head.push_str("Accept: */*\r\n");
    }
    let wants_body = !options.body.is_empty()
        || matches!(options.method, Method::Post | Method::Put | Method::Patch);
    if wants_body && !has("content-length") {
        head.push_str(&format!("Content-Length: {}\r\n", options.body.len()));
    }
    for (name, value) in &options.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(&options.body);
    out
}
