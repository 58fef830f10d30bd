//! Outbound request layer used to talk to other nodes.
//!
//! The [`RemoteTransport`] trait is the seam between the federation logic and
//! the wire. [`HttpTransport`] speaks the oneM2M HTTP binding; the in-process
//! [`crate::sim::SimNetwork`] implements the same trait for tests.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::{FederationError, Result};
use crate::types::ResourceType;

/// Response status codes (oneM2M `rsc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// Retrieve succeeded.
    Ok,
    /// Create succeeded.
    Created,
    /// Delete succeeded.
    Deleted,
    /// Update succeeded.
    Updated,
    /// Malformed request.
    BadRequest,
    /// Target resource does not exist.
    NotFound,
    /// Operation not allowed on the target.
    OperationNotAllowed,
    /// Request timed out at the receiver.
    RequestTimeout,
    /// Originator lacks privileges.
    OriginatorHasNoPrivilege,
    /// A resource with the same name already exists.
    AlreadyExists,
    /// Content violates the resource schema.
    ContentsUnacceptable,
    /// Receiver failed internally.
    InternalServerError,
    /// Operation not implemented by the receiver.
    NotImplemented,
    /// Target node could not be reached.
    TargetNotReachable,
}

impl ResponseStatus {
    /// Numeric `rsc` code.
    pub fn code(self) -> u16 {
        match self {
            ResponseStatus::Ok => 2000,
            ResponseStatus::Created => 2001,
            ResponseStatus::Deleted => 2002,
            ResponseStatus::Updated => 2004,
            ResponseStatus::BadRequest => 4000,
            ResponseStatus::NotFound => 4004,
            ResponseStatus::OperationNotAllowed => 4005,
            ResponseStatus::RequestTimeout => 4008,
            ResponseStatus::OriginatorHasNoPrivilege => 4103,
            ResponseStatus::AlreadyExists => 4105,
            ResponseStatus::ContentsUnacceptable => 4102,
            ResponseStatus::InternalServerError => 5000,
            ResponseStatus::NotImplemented => 5001,
            ResponseStatus::TargetNotReachable => 5103,
        }
    }

    /// Parse a numeric `rsc` code. Unknown codes collapse to their class.
    pub fn from_code(code: u16) -> Self {
        match code {
            2000 => ResponseStatus::Ok,
            2001 => ResponseStatus::Created,
            2002 => ResponseStatus::Deleted,
            2004 => ResponseStatus::Updated,
            4000 => ResponseStatus::BadRequest,
            4004 => ResponseStatus::NotFound,
            4005 => ResponseStatus::OperationNotAllowed,
            4008 => ResponseStatus::RequestTimeout,
            4103 => ResponseStatus::OriginatorHasNoPrivilege,
            4105 => ResponseStatus::AlreadyExists,
            4102 => ResponseStatus::ContentsUnacceptable,
            5001 => ResponseStatus::NotImplemented,
            5103 => ResponseStatus::TargetNotReachable,
            2001..=2999 => ResponseStatus::Ok,
            4000..=4999 => ResponseStatus::BadRequest,
            _ => ResponseStatus::InternalServerError,
        }
    }

    /// Map a plain HTTP status when no `X-M2M-RSC` header is present.
    pub fn from_http(status: u16) -> Self {
        match status {
            200 => ResponseStatus::Ok,
            201 => ResponseStatus::Created,
            204 => ResponseStatus::Deleted,
            400 => ResponseStatus::BadRequest,
            403 => ResponseStatus::OriginatorHasNoPrivilege,
            404 => ResponseStatus::NotFound,
            405 => ResponseStatus::OperationNotAllowed,
            408 => ResponseStatus::RequestTimeout,
            409 => ResponseStatus::AlreadyExists,
            501 => ResponseStatus::NotImplemented,
            502..=504 => ResponseStatus::TargetNotReachable,
            200..=299 => ResponseStatus::Ok,
            400..=499 => ResponseStatus::BadRequest,
            _ => ResponseStatus::InternalServerError,
        }
    }

    /// Whether the status reports success.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResponseStatus::Ok
                | ResponseStatus::Created
                | ResponseStatus::Deleted
                | ResponseStatus::Updated
        )
    }

    /// Whether the status means the peer was not reached at all.
    pub fn is_unreachable(self) -> bool {
        matches!(
            self,
            ResponseStatus::TargetNotReachable | ResponseStatus::RequestTimeout
        )
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// CRUD operation relayed to another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Create a child of the target.
    Create {
        /// Type of the resource to create.
        ty: ResourceType,
    },
    /// Retrieve the target.
    Retrieve,
    /// Update the target.
    Update,
    /// Delete the target.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create { .. } => f.write_str("CREATE"),
            Operation::Retrieve => f.write_str("RETRIEVE"),
            Operation::Update => f.write_str("UPDATE"),
            Operation::Delete => f.write_str("DELETE"),
        }
    }
}

/// Result of one remote request.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    /// Response status.
    pub status: ResponseStatus,
    /// Response content, flat resource JSON for resource responses.
    pub body: Option<Value>,
    /// Human readable diagnostic.
    pub diagnostic: Option<String>,
}

impl RemoteResponse {
    /// Response with a status and no content.
    pub fn status(status: ResponseStatus) -> Self {
        Self {
            status,
            body: None,
            diagnostic: None,
        }
    }

    /// Response carrying content.
    pub fn with_body(status: ResponseStatus, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
            diagnostic: None,
        }
    }

    /// Error response with a diagnostic message.
    pub fn error(status: ResponseStatus, diagnostic: impl Into<String>) -> Self {
        Self {
            status,
            body: None,
            diagnostic: Some(diagnostic.into()),
        }
    }

    /// The peer could not be reached.
    pub fn unreachable(diagnostic: impl Into<String>) -> Self {
        Self::error(ResponseStatus::TargetNotReachable, diagnostic)
    }

    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// String attribute of the returned resource.
    pub fn body_str(&self, name: &str) -> Option<&str> {
        self.body.as_ref()?.get(name)?.as_str()
    }
}

/// Outbound request interface. Implementations never fail with a Rust error:
/// network problems are reported as [`ResponseStatus::TargetNotReachable`].
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Retrieve the resource at `url`.
    async fn send_retrieve(&self, url: &str, originator: &str) -> RemoteResponse;

    /// Create a resource of type `ty` under `url`.
    async fn send_create(
        &self,
        url: &str,
        originator: &str,
        ty: ResourceType,
        body: Value,
    ) -> RemoteResponse;

    /// Update the resource at `url`.
    async fn send_update(&self, url: &str, originator: &str, body: Value) -> RemoteResponse;

    /// Delete the resource at `url`.
    async fn send_delete(&self, url: &str, originator: &str) -> RemoteResponse;
}

/// Wrap a flat resource body into the oneM2M primitive shape `{"m2m:xxx": {...}}`.
pub fn wrap_primitive(ty: ResourceType, body: Value) -> Value {
    let mut outer = Map::new();
    outer.insert(ty.short_name().to_string(), body);
    Value::Object(outer)
}

/// Unwrap a oneM2M primitive into a flat resource body. Bodies that are not
/// wrapped are returned unchanged.
pub fn unwrap_primitive(body: Value) -> Value {
    match body {
        Value::Object(map) if map.len() == 1 => {
            let (key, inner) = map.into_iter().next().unwrap_or_default();
            match (ResourceType::from_short_name(&key), inner) {
                (Some(ty), Value::Object(mut fields)) => {
                    fields
                        .entry("ty")
                        .or_insert_with(|| Value::from(ty.code()));
                    Value::Object(fields)
                }
                (_, inner) => {
                    let mut map = Map::new();
                    map.insert(key, inner);
                    Value::Object(map)
                }
            }
        }
        other => other,
    }
}

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Release version indicator sent with every request.
    pub release_version: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            release_version: "3".to_string(),
        }
    }
}

/// oneM2M HTTP binding over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// Create a transport with the given configuration. Fails when the HTTP
    /// client cannot be built, so no request ever runs without a timeout.
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| FederationError::Config {
                msg: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self { client, config })
    }

    fn headers(&self, originator: &str, ty: Option<ResourceType>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(originator) {
            headers.insert("X-M2M-Origin", v);
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            headers.insert("X-M2M-RI", v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.config.release_version) {
            headers.insert("X-M2M-RVI", v);
        }
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let content_type = match ty {
            Some(ty) => format!("application/json;ty={}", ty.code()),
            None => "application/json".to_string(),
        };
        if let Ok(v) = HeaderValue::from_str(&content_type) {
            headers.insert(CONTENT_TYPE, v);
        }
        headers
    }

    async fn execute(&self, request: reqwest::RequestBuilder, url: &str) -> RemoteResponse {
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(target_url = %url, error = %e, "request failed before a response");
                return RemoteResponse::unreachable(format!("{}: {}", url, e));
            }
        };

        let status = response
            .headers()
            .get("X-M2M-RSC")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u16>().ok())
            .map(ResponseStatus::from_code)
            .unwrap_or_else(|| ResponseStatus::from_http(response.status().as_u16()));

        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return RemoteResponse::unreachable(format!("{}: read error: {}", url, e)),
        };

        let parsed = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Value>(&text).ok()
        };

        if status.is_success() {
            RemoteResponse {
                status,
                body: parsed.map(unwrap_primitive),
                diagnostic: None,
            }
        } else {
            let diagnostic = parsed
                .as_ref()
                .and_then(|v| v.get("m2m:dbg"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| (!text.is_empty()).then_some(text));
            RemoteResponse {
                status,
                body: None,
                diagnostic,
            }
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(HttpTransportConfig::default()).expect("default HTTP client config must build")
    }
}

fn split_type(mut body: Value) -> (Option<ResourceType>, Value) {
    let ty = body
        .as_object_mut()
        .and_then(|m| m.remove("ty"))
        .and_then(|v| v.as_u64())
        .and_then(|c| ResourceType::from_code(c as u32));
    (ty, body)
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn send_retrieve(&self, url: &str, originator: &str) -> RemoteResponse {
        let request = self.client.get(url).headers(self.headers(originator, None));
        self.execute(request, url).await
    }

    async fn send_create(
        &self,
        url: &str,
        originator: &str,
        ty: ResourceType,
        body: Value,
    ) -> RemoteResponse {
        let (_, body) = split_type(body);
        let request = self
            .client
            .post(url)
            .headers(self.headers(originator, Some(ty)))
            .body(wrap_primitive(ty, body).to_string());
        self.execute(request, url).await
    }

    async fn send_update(&self, url: &str, originator: &str, body: Value) -> RemoteResponse {
        let (ty, body) = split_type(body);
        let payload = match ty {
            Some(ty) => wrap_primitive(ty, body),
            None => body,
        };
        let request = self
            .client
            .put(url)
            .headers(self.headers(originator, None))
            .body(payload.to_string());
        self.execute(request, url).await
    }

    async fn send_delete(&self, url: &str, originator: &str) -> RemoteResponse {
        let request = self.client.delete(url).headers(self.headers(originator, None));
        self.execute(request, url).await
    }
}
