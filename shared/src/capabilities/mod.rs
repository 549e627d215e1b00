//! Host capabilities the core depends on.
//!
//! The shell supplies the concrete key-value store, HTTP transport and
//! device location. Tests substitute in-memory fakes.

mod http;
mod kv;
mod location;

pub use self::http::{
    HttpError, HttpRequest, HttpResponse, HttpResult, HttpTransport, ValidatedUrl,
};
pub use self::kv::{
    load_json_or_default, store_json, InMemoryKvStore, KeyNamespace, KeyValueStore, KvError,
    KvKey, StorageErrorCode,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
pub use self::location::{
    resolve_user_location, DeviceLocation, LocationAccuracy, LocationError, PermissionState,
};
