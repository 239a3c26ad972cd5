//! The façade the proxy hot path talks to.
//!
//! `CaptureService` owns the store and the scope: it drops out-of-scope
//! traffic before it touches SQLite, stamps capture timestamps, and answers
//! the query API's find operations (filter parsing, projection pass-through,
//! method validation on the way out). Log calls never hold traffic back: on
//! a storage failure the error surfaces promptly and the proxy keeps
//! serving, minus one log entry.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    filter::{Filter, FilterParseError},
    projection::Projection,
    scope::{Scope, ScopeError},
    storage::{
        CapturedRequest, CapturedResponse, RequestLog, ResponseLog, Storage, StorageError,
    },
};

/// Method tokens accepted when surfacing records to the query API.
/// Ingestion stores whatever was observed; validation happens on the way out.
const RECOGNIZED_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

#[derive(Debug)]
pub enum CaptureError {
    NotFound,
    InvalidId(String),
    InvalidMethod(String),
    FilterParse(FilterParseError),
    Scope(ScopeError),
    Storage(StorageError),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("request log not found"),
            Self::InvalidId(id) => write!(f, "invalid request log id `{id}`"),
            Self::InvalidMethod(method) => write!(f, "request has invalid method `{method}`"),
            Self::FilterParse(err) => err.fmt(f),
            Self::Scope(err) => err.fmt(f),
            Self::Storage(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FilterParse(err) => Some(err),
            Self::Scope(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::NotFound | Self::InvalidId(_) | Self::InvalidMethod(_) => None,
        }
    }
}

impl From<StorageError> for CaptureError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => Self::NotFound,
            other => Self::Storage(other),
        }
    }
}

impl From<FilterParseError> for CaptureError {
    fn from(err: FilterParseError) -> Self {
        Self::FilterParse(err)
    }
}

impl From<ScopeError> for CaptureError {
    fn from(err: ScopeError) -> Self {
        Self::Scope(err)
    }
}

/// Parses the textual form of a request log id: the decimal rendering of
/// the store id. Round-trips with `RequestLog::id.to_string()`.
pub fn resolve_id(text: &str) -> Result<i64, CaptureError> {
    let id = text
        .trim()
        .parse::<i64>()
        .map_err(|_| CaptureError::InvalidId(text.to_owned()))?;
    if id <= 0 {
        return Err(CaptureError::InvalidId(text.to_owned()));
    }
    Ok(id)
}

/// Process-wide capture state: constructed once at startup, passed by
/// reference to the proxy and the query API.
#[derive(Debug)]
pub struct CaptureService {
    storage: Storage,
    scope: Scope,
}

impl CaptureService {
    pub fn open(config: &Config) -> Result<Self, CaptureError> {
        let scope = Scope::from_config(&config.scope.rules)?;
        let storage = Storage::open(config.storage.path.clone())?;
        Ok(Self::new(storage, scope))
    }

    pub fn new(storage: Storage, scope: Scope) -> Self {
        Self { storage, scope }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Logs one observed request. Out-of-scope traffic is not logged at all
    /// and yields `None`; the caller pairs the returned id with the response
    /// half later.
    pub async fn log_request(
        &self,
        req: &CapturedRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<RequestLog>, CaptureError> {
        let url = req.url.to_string();
        if !self.scope.permits(&url, &req.headers, &req.body) {
            tracing::debug!(url = %url, "request out of scope, skipping log");
            return Ok(None);
        }

        let log = self.storage.add_request(req, Utc::now(), cancel).await?;
        tracing::debug!(id = log.id, method = %req.method, url = %url, "logged request");
        Ok(Some(log))
    }

    pub async fn log_response(
        &self,
        req_id: i64,
        res: &CapturedResponse,
        cancel: &CancellationToken,
    ) -> Result<ResponseLog, CaptureError> {
        let log = self.storage.add_response(req_id, res, Utc::now(), cancel).await?;
        tracing::debug!(
            id = log.id,
            request_id = req_id,
            status = res.status.as_u16(),
            "logged response"
        );
        Ok(log)
    }

    /// All matching request logs, most recent first. The filter predicate
    /// runs in memory over the records as projected.
    pub async fn find_all(
        &self,
        filter: &str,
        projection: &Projection,
        cancel: &CancellationToken,
    ) -> Result<Vec<RequestLog>, CaptureError> {
        let filter = Filter::parse(filter)?;
        let logs = self.storage.find_all(projection, cancel).await?;

        let mut matching = Vec::with_capacity(logs.len());
        for log in logs {
            if !filter.matches(&log) {
                continue;
            }
            validate_method(&log)?;
            matching.push(log);
        }
        Ok(matching)
    }

    pub async fn find_by_id(
        &self,
        id: i64,
        projection: &Projection,
        cancel: &CancellationToken,
    ) -> Result<RequestLog, CaptureError> {
        let log = self.storage.find_by_id(id, projection, cancel).await?;
        validate_method(&log)?;
        Ok(log)
    }

    pub async fn delete_request(
        &self,
        id: i64,
        cancel: &CancellationToken,
    ) -> Result<bool, CaptureError> {
        Ok(self.storage.delete_request(id, cancel).await?)
    }

    pub async fn wipe(&self, cancel: &CancellationToken) -> Result<(), CaptureError> {
        Ok(self.storage.wipe(cancel).await?)
    }
}

fn validate_method(log: &RequestLog) -> Result<(), CaptureError> {
    let Some(method) = log.method.as_deref() else {
        return Ok(());
    };
    if RECOGNIZED_METHODS.contains(&method) {
        Ok(())
    } else {
        Err(CaptureError::InvalidMethod(method.to_owned()))
    }
}
