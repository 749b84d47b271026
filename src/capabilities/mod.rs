//! Host capabilities the core depends on.
//!
//! The shell (iOS/Android) implements [`Transport`] and [`KeyValueStore`]
//! and feeds reachability into a [`ConnectivityMonitor`]. Everything else in
//! the crate is written against these seams.

mod http;
mod kv;
mod network;

pub use self::http::{
    ApiPath, ContentType, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse,
    Transport, TransportFailure, AUTHORIZATION_HEADER, CONTENT_TYPE_HEADER,
    IDEMPOTENCY_KEY_HEADER, MAX_REQUEST_BODY_SIZE,
};
pub use self::kv::{
    get_json, set_json, KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKeyValueStore,
};
pub use self::network::{ConnectivityEvents, ConnectivityMonitor, Transition};
