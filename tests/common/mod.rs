#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::capabilities::{HttpHeaders, IDEMPOTENCY_KEY_HEADER};
use courier::outbox::MemoryQueueStorage;
use courier::{
    App, ConnectivityMonitor, CoreConfig, CoreEvent, CredentialPair, CredentialStore, HttpMethod,
    HttpRequest, HttpResponse, MemoryCredentialStore, OpId, Operation, QueueStorage, Transport,
    TransportFailure, UserId,
};
use tokio::sync::{broadcast, oneshot};

pub const REFRESH_PATH: &str = "/auth/refresh";

struct BackendState {
    access_token: String,
    refresh_token: Option<String>,
    issued: u32,
    reachable: bool,
    always_unauthorized: bool,
    scripted: VecDeque<TransportFailure>,
    requests: Vec<HttpRequest>,
    delivered: Vec<String>,
    hold: Option<Hold>,
}

struct Hold {
    refresh_only: bool,
    arrived: oneshot::Sender<HttpRequest>,
    release: oneshot::Receiver<()>,
}

/// A request parked by [`MockBackend::hold_next_request`].
pub struct HeldRequest {
    pub arrived: oneshot::Receiver<HttpRequest>,
    pub release: oneshot::Sender<()>,
}

/// In-process stand-in for the chat backend.
///
/// Accepts exactly one access token at a time and hands out numbered
/// `access-N` / `refresh-N` pairs on refresh. Every call yields before
/// answering so concurrent callers interleave.
pub struct MockBackend {
    state: Mutex<BackendState>,
    refresh_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                access_token: "access-0".to_string(),
                refresh_token: Some("refresh-0".to_string()),
                issued: 0,
                reachable: true,
                always_unauthorized: false,
                scripted: VecDeque::new(),
                requests: Vec::new(),
                delivered: Vec::new(),
                hold: None,
            }),
            refresh_calls: AtomicUsize::new(0),
        })
    }

    pub fn initial_pair() -> CredentialPair {
        CredentialPair::new("access-0", Some("refresh-0".to_string())).unwrap()
    }

    /// The access token the client holds stops being accepted.
    pub fn expire_access_token(&self) {
        let mut state = self.state.lock().unwrap();
        state.access_token = format!("server-side-{}", state.issued);
    }

    pub fn revoke_refresh_token(&self) {
        self.state.lock().unwrap().refresh_token = None;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn set_always_unauthorized(&self, value: bool) {
        self.state.lock().unwrap().always_unauthorized = value;
    }

    /// Parks the next request (API or refresh) until the returned handle is
    /// released. The request is answered with the backend state at release.
    pub fn hold_next_request(&self) -> HeldRequest {
        self.hold(false)
    }

    pub fn hold_next_refresh(&self) -> HeldRequest {
        self.hold(true)
    }

    fn hold(&self, refresh_only: bool) -> HeldRequest {
        let (arrived_tx, arrived) = oneshot::channel();
        let (release, release_rx) = oneshot::channel();
        self.state.lock().unwrap().hold = Some(Hold {
            refresh_only,
            arrived: arrived_tx,
            release: release_rx,
        });
        HeldRequest { arrived, release }
    }

    pub fn fail_next(&self, failure: TransportFailure) {
        self.state.lock().unwrap().scripted.push_back(failure);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Texts of the messages the backend accepted, in arrival order.
    pub fn delivered(&self) -> Vec<String> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn api_requests(&self) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.as_str() != REFRESH_PATH)
            .collect()
    }

    fn refresh(&self, request: &HttpRequest) -> Result<HttpResponse, TransportFailure> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let presented = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok())
            .and_then(|v| v["refresh_token"].as_str().map(str::to_string));

        let mut state = self.state.lock().unwrap();
        if presented.is_none() || presented != state.refresh_token {
            return Err(TransportFailure::status(
                401,
                r#"{"error":"invalid_grant"}"#,
            ));
        }

        state.issued += 1;
        state.access_token = format!("access-{}", state.issued);
        state.refresh_token = Some(format!("refresh-{}", state.issued));
        let body = serde_json::json!({
            "access_token": state.access_token,
            "refresh_token": state.refresh_token,
        });
        Ok(HttpResponse::ok(serde_json::to_vec(&body).unwrap()))
    }
}

#[async_trait::async_trait]
impl Transport for MockBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportFailure> {
        let hold = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            let applies = state
                .hold
                .as_ref()
                .is_some_and(|h| !h.refresh_only || request.path.as_str() == REFRESH_PATH);
            if applies {
                state.hold.take()
            } else {
                None
            }
        };
        if let Some(hold) = hold {
            let _ = hold.arrived.send(request.clone());
            let _ = hold.release.await;
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        if !self.state.lock().unwrap().reachable {
            return Err(TransportFailure::Connection {
                reason: "network unreachable".into(),
            });
        }
        if request.path.as_str() == REFRESH_PATH {
            return self.refresh(&request);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.scripted.pop_front() {
            return Err(failure);
        }
        if state.always_unauthorized
            || request.bearer_token() != Some(state.access_token.as_str())
        {
            return Err(TransportFailure::status(
                401,
                r#"{"message":"access token expired"}"#,
            ));
        }

        if request.method != HttpMethod::Get {
            let text = request
                .body
                .as_deref()
                .and_then(|b| serde_json::from_slice::<serde_json::Value>(b).ok())
                .and_then(|v| v["text"].as_str().map(str::to_string))
                .or_else(|| {
                    request
                        .headers
                        .get(IDEMPOTENCY_KEY_HEADER)
                        .map(str::to_string)
                })
                .unwrap_or_default();
            state.delivered.push(text);
        }

        Ok(HttpResponse::new(
            200,
            HttpHeaders::new(),
            br#"{"ok":true}"#.to_vec(),
        ))
    }
}

pub fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}

/// A chat message send; the op id doubles as the message text.
pub fn message(id: &str) -> Operation {
    Operation::post("/chat/messages")
        .unwrap()
        .with_id(OpId::new(id).unwrap())
        .json(&serde_json::json!({ "text": id }))
        .unwrap()
        .queueable()
        .unwrap()
}

pub struct TestApp {
    pub app: App,
    pub backend: Arc<MockBackend>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub storage: Arc<dyn QueueStorage>,
    pub events: broadcast::Receiver<CoreEvent>,
}

pub async fn signed_in_app(online: bool) -> TestApp {
    signed_in_app_with(
        online,
        CoreConfig::default(),
        Arc::new(MemoryQueueStorage::new()),
        MockBackend::new(),
    )
    .await
}

pub async fn signed_in_app_with(
    online: bool,
    config: CoreConfig,
    storage: Arc<dyn QueueStorage>,
    backend: Arc<MockBackend>,
) -> TestApp {
    let credentials = Arc::new(MemoryCredentialStore::new());
    let app = App::new(
        config,
        backend.clone(),
        credentials.clone(),
        storage.clone(),
        ConnectivityMonitor::new(online),
    )
    .unwrap();
    let events = app.subscribe();
    app.sign_in(user("alice"), MockBackend::initial_pair())
        .await
        .unwrap();

    TestApp {
        app,
        backend,
        credentials,
        storage,
        events,
    }
}

pub fn drain_events(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Collects events until `stop` matches one, failing after a few seconds.
pub async fn events_until<F>(rx: &mut broadcast::Receiver<CoreEvent>, stop: F) -> Vec<CoreEvent>
where
    F: Fn(&CoreEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Lets spawned background work (drains, watchers) run to completion.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn credentials_of(store: &dyn CredentialStore) -> Option<(String, Option<String>)> {
    store.get().map(|pair| {
        (
            pair.access_token.expose().to_string(),
            pair.refresh_token.as_ref().map(|t| t.expose().to_string()),
        )
    })
}
