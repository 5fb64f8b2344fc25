//! HTTP front end for the worker.
//!
//! Every request that does not start with `/__sync/` is turned into a fetch
//! event against the configured origin. The control endpoints stand in for
//! the page side of the worker: message posting, client mailboxes and the
//! browser's `online` signal.
//!
//! | Route                                  | Effect                          |
//! |----------------------------------------|---------------------------------|
//! | `POST /__sync/message[?client=ID]`     | deliver a client message        |
//! | `POST /__sync/clients`                 | register a mailbox client       |
//! | `GET /__sync/clients/ID/messages`      | take the client's messages      |
//! | `DELETE /__sync/clients/ID`            | drop a client                   |
//! | `POST /__sync/online`                  | connectivity restored           |
//! | `POST /__sync/push`                    | relay a push payload            |
//! | `POST /__sync/notification-click`      | relay a notification click      |
//! | `GET /__sync/status`                   | queue and dead-letter counts    |

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use serde::Deserialize;
use spin::Mutex;
use sync_worker::fetch::RequestMode;
use sync_worker::{
    ClientId, ClientMessage, EventOutcome, FetchError, Mailbox, Method, Request, Response,
    SyncPoller, SyncWorker, WorkerError, WorkerEvent,
};

const CONTROL_PREFIX: &str = "/__sync/";

/// Response header naming where the answer came from.
pub const SOURCE_HEADER: &str = "x-sync-source";
/// Response header set when a failed write was queued for replay.
pub const QUEUED_HEADER: &str = "x-sync-queued";

/// Headers the listener writes itself.
const HOP_BY_HOP: &[&str] = &["connection", "content-length", "transfer-encoding", "keep-alive"];

// ── Plain request/response ───────────────────────────────────────────

/// An incoming request, detached from the listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    /// Path and query, as sent by the client.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.target.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Page loads are GETs that either say so or ask for HTML.
    fn is_navigation(&self) -> bool {
        if !self.method.eq_ignore_ascii_case("GET") {
            return false;
        }
        self.header("sec-fetch-mode")
            .is_some_and(|mode| mode.eq_ignore_ascii_case("navigate"))
            || self
                .header("accept")
                .is_some_and(|accept| accept.contains("text/html"))
    }
}

/// An outgoing response, detached from the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![(
                String::from("content-type"),
                String::from("application/json"),
            )],
            body: value.to_string().into_bytes(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

}

impl From<Response> for ProxyResponse {
    fn from(response: Response) -> Self {
        let mut headers: Vec<(String, String)> = response
            .headers
            .into_iter()
            .filter(|(name, _)| {
                !HOP_BY_HOP
                    .iter()
                    .any(|hop| name.eq_ignore_ascii_case(hop))
            })
            .collect();
        headers.push((
            String::from(SOURCE_HEADER),
            String::from(response.source.as_str()),
        ));
        Self {
            status: response.status,
            headers,
            body: response.body,
        }
    }
}

// ── Proxy ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ClickBody {
    #[serde(default)]
    url: Option<String>,
}

/// Routes requests to a worker. Dropping it stops the poller.
pub struct Proxy {
    worker: Arc<SyncWorker>,
    poller: Option<SyncPoller>,
    mailboxes: Mutex<BTreeMap<ClientId, Mailbox>>,
}

impl Proxy {
    pub fn new(worker: Arc<SyncWorker>, poller: Option<SyncPoller>) -> Self {
        Self {
            worker,
            poller,
            mailboxes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        if let Some(route) = request.path().strip_prefix(CONTROL_PREFIX) {
            return self.control(route, &request);
        }
        self.forward(request)
    }

    fn control(&self, route: &str, request: &ProxyRequest) -> ProxyResponse {
        let segments: Vec<&str> = route.split('/').filter(|s| !s.is_empty()).collect();
        match (request.method.as_str(), segments.as_slice()) {
            ("POST", ["message"]) => self.message(request),
            ("POST", ["clients"]) => self.register_client(),
            ("GET", ["clients", id, "messages"]) => self.client_messages(id),
            ("DELETE", ["clients", id]) => self.unregister_client(id),
            ("POST", ["online"]) => self.online(),
            ("POST", ["push"]) => {
                let data = (!request.body.is_empty()).then(|| request.body.clone());
                self.event_response(WorkerEvent::Push { data })
            }
            ("POST", ["notification-click"]) => {
                let click: ClickBody = if request.body.is_empty() {
                    ClickBody::default()
                } else {
                    match serde_json::from_slice(&request.body) {
                        Ok(click) => click,
                        Err(e) => return ProxyResponse::error(400, &e.to_string()),
                    }
                };
                self.event_response(WorkerEvent::NotificationClick { url: click.url })
            }
            ("GET", ["status"]) => match self.worker.status() {
                Ok(status) => ProxyResponse::json(200, &serde_json::json!(status)),
                Err(e) => worker_failure(&e),
            },
            _ => ProxyResponse::error(404, "unknown control route"),
        }
    }

    fn message(&self, request: &ProxyRequest) -> ProxyResponse {
        let message: ClientMessage = match serde_json::from_slice(&request.body) {
            Ok(message) => message,
            Err(e) => return ProxyResponse::error(400, &format!("invalid message: {e}")),
        };
        let client = match request.query_param("client").map(str::parse::<ClientId>) {
            None => None,
            Some(Ok(id)) => Some(id),
            Some(Err(_)) => return ProxyResponse::error(400, "invalid client id"),
        };
        self.event_response(WorkerEvent::Message { client, message })
    }

    fn register_client(&self) -> ProxyResponse {
        let mailbox = Mailbox::new();
        let id = self.worker.clients().register(Arc::new(mailbox.clone()));
        self.mailboxes.lock().insert(id, mailbox);
        debug!("client {} registered", id);
        ProxyResponse::json(201, &serde_json::json!({ "client": id }))
    }

    fn client_messages(&self, id: &str) -> ProxyResponse {
        let Ok(id) = id.parse::<ClientId>() else {
            return ProxyResponse::error(400, "invalid client id");
        };
        match self.mailboxes.lock().get(&id) {
            Some(mailbox) => ProxyResponse::json(200, &serde_json::json!(mailbox.drain())),
            None => ProxyResponse::error(404, "unknown client"),
        }
    }

    fn unregister_client(&self, id: &str) -> ProxyResponse {
        let Ok(id) = id.parse::<ClientId>() else {
            return ProxyResponse::error(400, "invalid client id");
        };
        let Some(mailbox) = self.mailboxes.lock().remove(&id) else {
            return ProxyResponse::error(404, "unknown client");
        };
        mailbox.close();
        self.worker.clients().unregister(id);
        ProxyResponse::empty(204)
    }

    fn online(&self) -> ProxyResponse {
        if let Some(poller) = &self.poller {
            if poller.wake() {
                return ProxyResponse::empty(202);
            }
            warn!("sync poller has stopped; draining inline");
        }
        self.event_response(WorkerEvent::ConnectivityRestored)
    }

    fn event_response(&self, event: WorkerEvent) -> ProxyResponse {
        match self.worker.dispatch(event) {
            Ok(EventOutcome::Reply(Some(reply))) => {
                ProxyResponse::json(200, &serde_json::json!(reply))
            }
            Ok(EventOutcome::Broadcast(delivered)) => {
                ProxyResponse::json(200, &serde_json::json!({ "delivered": delivered }))
            }
            Ok(EventOutcome::Drained(report)) => ProxyResponse::json(200, &serde_json::json!(report)),
            Ok(_) => ProxyResponse::empty(204),
            Err(e) => worker_failure(&e),
        }
    }

    // ── Fetch ────────────────────────────────────────────────

    fn forward(&self, request: ProxyRequest) -> ProxyResponse {
        let fetch = match self.to_fetch(&request) {
            Ok(fetch) => fetch,
            Err(FetchError::UnsupportedMethod(method)) => {
                return ProxyResponse::error(405, &format!("unsupported method {method}"));
            }
            Err(e) => return ProxyResponse::error(400, &e.to_string()),
        };
        // Only the configured origin is proxied; anything else would turn the
        // listener into a relay to arbitrary hosts.
        if !is_origin_form(&request.target) || fetch.url.origin() != self.worker.origin().origin() {
            warn!("refusing off-origin target {}", request.target);
            return ProxyResponse::error(400, "request target must be a path on the proxied origin");
        }

        match self.worker.dispatch(WorkerEvent::Fetch(fetch)) {
            Ok(EventOutcome::Response(response)) => response.into(),
            Ok(other) => {
                error!("fetch produced {:?}", other);
                ProxyResponse::error(500, "unexpected worker outcome")
            }
            Err(WorkerError::Fetch(FetchError::Network { source, queued })) => {
                let status = if queued { 503 } else { 502 };
                let mut response = ProxyResponse::json(
                    status,
                    &serde_json::json!({ "error": source.to_string(), "queued": queued }),
                );
                if queued {
                    response
                        .headers
                        .push((String::from(QUEUED_HEADER), String::from("true")));
                }
                response
            }
            Err(e) => worker_failure(&e),
        }
    }

    fn to_fetch(&self, request: &ProxyRequest) -> Result<Request, FetchError> {
        let method: Method = request.method.parse()?;
        let url = self.worker.origin().join(&request.target)?;
        let mut fetch = Request::new(method, url);
        if request.is_navigation() {
            fetch.mode = RequestMode::Navigate;
        }
        fetch.headers = request
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
            .cloned()
            .collect();
        if !request.body.is_empty() {
            fetch.body = Some(request.body.clone());
        }
        Ok(fetch)
    }
}

/// `/path?query`, as opposed to absolute (`http://host/x`) or
/// protocol-relative (`//host/x`) targets.
fn is_origin_form(target: &str) -> bool {
    target.starts_with('/') && !target.starts_with("//")
}

fn worker_failure(e: &WorkerError) -> ProxyResponse {
    error!("worker error: {}", e);
    ProxyResponse::error(500, &e.to_string())
}

// ── Listener ─────────────────────────────────────────────────────────

fn read_request(request: &mut tiny_http::Request) -> std::io::Result<ProxyRequest> {
    let mut body = Vec::new();
    request.as_reader().read_to_end(&mut body)?;
    Ok(ProxyRequest {
        method: request.method().to_string(),
        target: request.url().to_string(),
        headers: request
            .headers()
            .iter()
            .map(|header| (header.field.to_string(), header.value.to_string()))
            .collect(),
        body,
    })
}

fn write_response(request: tiny_http::Request, response: ProxyResponse) {
    let mut reply =
        tiny_http::Response::from_data(response.body).with_status_code(tiny_http::StatusCode(response.status));
    for (name, value) in &response.headers {
        match tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => reply.add_header(header),
            Err(()) => debug!("dropping unencodable header {}", name),
        }
    }
    if let Err(e) = request.respond(reply) {
        warn!("could not write response: {}", e);
    }
}

fn handle_connection(proxy: &Proxy, mut request: tiny_http::Request) {
    let incoming = match read_request(&mut request) {
        Ok(incoming) => incoming,
        Err(e) => {
            warn!("could not read request body: {}", e);
            write_response(request, ProxyResponse::error(400, "unreadable body"));
            return;
        }
    };
    debug!("{} {}", incoming.method, incoming.target);
    let response = proxy.handle(incoming);
    write_response(request, response);
}

/// Accept requests until the listener closes or `max_requests` have been
/// taken, handing them to a pool of `workers` threads. At most `workers`
/// accepted requests wait for a free thread; beyond that the listener stops
/// accepting. Returns the number of requests accepted.
pub fn serve(
    proxy: Arc<Proxy>,
    server: &tiny_http::Server,
    workers: usize,
    max_requests: Option<usize>,
) -> usize {
    let (queue, incoming) = mpsc::sync_channel::<tiny_http::Request>(workers);
    let incoming = Arc::new(parking_lot::Mutex::new(incoming));

    let mut pool: Vec<JoinHandle<()>> = Vec::with_capacity(workers);
    for n in 0..workers {
        let proxy = Arc::clone(&proxy);
        let incoming = Arc::clone(&incoming);
        let spawned = thread::Builder::new()
            .name(format!("proxy-worker-{n}"))
            .spawn(move || loop {
                let next = incoming.lock().recv();
                match next {
                    Ok(request) => handle_connection(&proxy, request),
                    Err(_) => break,
                }
            });
        match spawned {
            Ok(handle) => pool.push(handle),
            Err(e) => error!("could not spawn request worker: {}", e),
        }
    }
    if pool.is_empty() {
        error!("no request workers running; not accepting");
        return 0;
    }
    debug!("{} request worker(s) started", pool.len());

    let mut accepted = 0;
    for request in server.incoming_requests() {
        accepted += 1;
        if queue.send(request).is_err() {
            error!("request workers have stopped");
            break;
        }
        if max_requests.is_some_and(|max| accepted >= max) {
            break;
        }
    }

    drop(queue);
    for handle in pool {
        if handle.join().is_err() {
            error!("request worker panicked");
        }
    }
    info!("listener stopped after {} request(s)", accepted);
    accepted
}

#[cfg(test)]
impl ProxyRequest {
    fn new(method: &str, target: &str) -> Self {
        Self {
            method: String::from(method),
            target: String::from(target),
            ..Self::default()
        }
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((String::from(name), String::from(value)));
        self
    }

    fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

#[cfg(test)]
impl ProxyResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}
