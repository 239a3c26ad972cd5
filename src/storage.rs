//! Durable store for captured request/response pairs.
//!
//! Three tables: `requests`, `responses` (one row per request at most,
//! cascading on delete) and `headers`, a side-table holding the ordered
//! multi-valued header pairs of either parent. Writes are transactional; a
//! request row and its header rows become visible together or not at all.
//!
//! Reads are projection-driven and run in two phases: one base `SELECT`
//! (joining `responses` only when a response field is requested), then one
//! prepared header query per returned row and side, with the statement
//! reused across rows.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::projection::{Column, HeaderField, Projection, QueryPlan};

const READER_CONNECTIONS: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  proto TEXT,
  url TEXT,
  method TEXT,
  body BLOB,
  timestamp DATETIME
);

CREATE TABLE IF NOT EXISTS responses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  req_id INTEGER REFERENCES requests(id) ON DELETE CASCADE,
  proto TEXT,
  status_code INTEGER,
  status_reason TEXT,
  body BLOB,
  timestamp DATETIME
);

CREATE TABLE IF NOT EXISTS headers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  req_id INTEGER REFERENCES requests(id) ON DELETE CASCADE,
  res_id INTEGER REFERENCES responses(id) ON DELETE CASCADE,
  key TEXT,
  value TEXT
);
"#;

#[derive(Debug)]
pub enum StorageError {
    /// The requested record does not exist.
    NotFound,
    /// The operation was cancelled before its transaction committed.
    Cancelled,
    Database {
        op: &'static str,
        source: rusqlite::Error,
    },
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Task(String),
}

impl StorageError {
    fn db(op: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Database { op, source }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("request log not found"),
            Self::Cancelled => f.write_str("operation cancelled before commit"),
            Self::Database { op, source } => write!(f, "storage: could not {op}: {source}"),
            Self::CreateDir { path, source } => {
                write!(f, "storage: create dir {}: {source}", path.display())
            }
            Self::Task(message) => write!(f, "storage: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database { source, .. } => Some(source),
            Self::CreateDir { source, .. } => Some(source),
            Self::NotFound | Self::Cancelled | Self::Task(_) => None,
        }
    }
}

/// A request as observed on the wire, handed over by the proxy hot path.
///
/// Headers are explicit ordered pairs rather than a `HeaderMap` so the
/// front-end can hand over duplicates and original key casing untouched.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: hyper::Method,
    pub url: hyper::Uri,
    pub version: hyper::Version,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub version: hyper::Version,
    pub status: hyper::StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CapturedResponse {
    /// The status line after the protocol, e.g. `200 OK`.
    pub fn status_line(&self) -> String {
        self.status.to_string()
    }
}

/// A stored request, populated according to the projection it was read
/// with. `id` is always populated; everything else is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestLog {
    pub id: i64,
    pub proto: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub response: Option<ResponseLog>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseLog {
    pub id: i64,
    pub request_id: Option<i64>,
    pub proto: Option<String>,
    pub status_code: Option<u16>,
    pub status_reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Handle to the store. Cheap to clone; all clones share one pool of a
/// writer connection and a few reader connections.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Arc<Pool>,
}

#[derive(Debug)]
struct Pool {
    db_path: PathBuf,
    write_connection: Mutex<Connection>,
    read_connections: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Pool {
    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.write_connection
            .lock()
            .expect("writer connection lock poisoned")
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.read_connections.len();
        self.read_connections[idx]
            .lock()
            .expect("reader connection lock poisoned")
    }
}

impl Storage {
    /// Opens (creating if necessary) the database at `db_path`, creating the
    /// parent directory and the schema when absent. Existing schemas are
    /// left untouched.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let db_path: PathBuf = db_path.into();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let write_connection = open_connection(&db_path)?;
        write_connection
            .execute_batch(SCHEMA)
            .map_err(StorageError::db("create schema"))?;

        let mut read_connections = Vec::with_capacity(READER_CONNECTIONS);
        for _ in 0..READER_CONNECTIONS {
            read_connections.push(Mutex::new(open_connection(&db_path)?));
        }

        Ok(Self {
            pool: Arc::new(Pool {
                db_path,
                write_connection: Mutex::new(write_connection),
                read_connections,
                next_reader: AtomicUsize::new(0),
            }),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.pool.db_path
    }

    /// Inserts the request row and its header rows in one transaction and
    /// returns the record populated with its assigned id.
    pub async fn add_request(
        &self,
        req: &CapturedRequest,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RequestLog, StorageError> {
        let pool = Arc::clone(&self.pool);
        let cancel = cancel.clone();
        let record = RequestLog {
            id: 0,
            proto: Some(proto_string(req.version)),
            url: Some(req.url.to_string()),
            method: Some(req.method.as_str().to_owned()),
            headers: req.headers.clone(),
            body: Some(req.body.to_vec()),
            timestamp: Some(timestamp),
            response: None,
        };

        tokio::task::spawn_blocking(move || add_request_blocking(&pool, record, &cancel))
            .await
            .map_err(|err| StorageError::Task(format!("join add_request task: {err}")))?
    }

    /// Inserts the response half for `req_id`. The status reason is the
    /// status line from index 4 onward, empty when the line is shorter.
    pub async fn add_response(
        &self,
        req_id: i64,
        res: &CapturedResponse,
        timestamp: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ResponseLog, StorageError> {
        let pool = Arc::clone(&self.pool);
        let cancel = cancel.clone();
        let record = ResponseLog {
            id: 0,
            request_id: Some(req_id),
            proto: Some(proto_string(res.version)),
            status_code: Some(res.status.as_u16()),
            status_reason: Some(status_reason(&res.status_line()).to_owned()),
            headers: res.headers.clone(),
            body: Some(res.body.to_vec()),
            timestamp: Some(timestamp),
        };

        tokio::task::spawn_blocking(move || add_response_blocking(&pool, record, &cancel))
            .await
            .map_err(|err| StorageError::Task(format!("join add_response task: {err}")))?
    }

    pub async fn find_by_id(
        &self,
        id: i64,
        projection: &Projection,
        cancel: &CancellationToken,
    ) -> Result<RequestLog, StorageError> {
        let pool = Arc::clone(&self.pool);
        let plan = projection.plan();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            find_by_id_blocking(&pool.reader(), &plan, id)
        })
        .await
        .map_err(|err| StorageError::Task(format!("join find_by_id task: {err}")))?
    }

    /// Returns all stored requests, most recent first.
    pub async fn find_all(
        &self,
        projection: &Projection,
        cancel: &CancellationToken,
    ) -> Result<Vec<RequestLog>, StorageError> {
        let pool = Arc::clone(&self.pool);
        let plan = projection.plan();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            find_all_blocking(&pool.reader(), &plan)
        })
        .await
        .map_err(|err| StorageError::Task(format!("join find_all task: {err}")))?
    }

    /// Deletes one request; response and header rows cascade. Returns
    /// whether a row was deleted.
    pub async fn delete_request(
        &self,
        id: i64,
        cancel: &CancellationToken,
    ) -> Result<bool, StorageError> {
        let pool = Arc::clone(&self.pool);
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let deleted = pool
                .writer()
                .execute("DELETE FROM requests WHERE id = ?1", params![id])
                .map_err(StorageError::db("delete request"))?;
            Ok(deleted == 1)
        })
        .await
        .map_err(|err| StorageError::Task(format!("join delete_request task: {err}")))?
    }

    /// Deletes every stored request; the cascade clears the rest.
    pub async fn wipe(&self, cancel: &CancellationToken) -> Result<(), StorageError> {
        let pool = Arc::clone(&self.pool);
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            pool.writer()
                .execute("DELETE FROM requests", [])
                .map_err(StorageError::db("wipe requests"))?;
            Ok(())
        })
        .await
        .map_err(|err| StorageError::Task(format!("join wipe task: {err}")))?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(StorageError::db("open database"))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(StorageError::db("set PRAGMA journal_mode=WAL"))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(StorageError::db("set PRAGMA synchronous=NORMAL"))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(StorageError::db("set PRAGMA foreign_keys=ON"))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(StorageError::db("set busy_timeout"))?;

    Ok(conn)
}

fn proto_string(version: hyper::Version) -> String {
    format!("{version:?}")
}

// The status line is `NNN reason`; everything past the code and the space.
fn status_reason(status_line: &str) -> &str {
    if status_line.len() > 4 {
        &status_line[4..]
    } else {
        ""
    }
}

fn add_request_blocking(
    pool: &Pool,
    mut record: RequestLog,
    cancel: &CancellationToken,
) -> Result<RequestLog, StorageError> {
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let mut conn = pool.writer();
    let tx = conn
        .transaction()
        .map_err(StorageError::db("start transaction"))?;

    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO requests (proto, url, method, body, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(StorageError::db("prepare insert request"))?;
        stmt.execute(params![
            record.proto,
            record.url,
            record.method,
            record.body,
            record.timestamp,
        ])
        .map_err(StorageError::db("insert request"))?;
    }
    record.id = tx.last_insert_rowid();

    insert_headers(&tx, "req_id", record.id, &record.headers)?;

    if cancel.is_cancelled() {
        // Dropping the transaction rolls it back.
        return Err(StorageError::Cancelled);
    }
    tx.commit().map_err(StorageError::db("commit transaction"))?;

    Ok(record)
}

fn add_response_blocking(
    pool: &Pool,
    mut record: ResponseLog,
    cancel: &CancellationToken,
) -> Result<ResponseLog, StorageError> {
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let mut conn = pool.writer();
    let tx = conn
        .transaction()
        .map_err(StorageError::db("start transaction"))?;

    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO responses (req_id, proto, status_code, status_reason, body, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(StorageError::db("prepare insert response"))?;
        stmt.execute(params![
            record.request_id,
            record.proto,
            record.status_code,
            record.status_reason,
            record.body,
            record.timestamp,
        ])
        .map_err(StorageError::db("insert response"))?;
    }
    record.id = tx.last_insert_rowid();

    insert_headers(&tx, "res_id", record.id, &record.headers)?;

    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    tx.commit().map_err(StorageError::db("commit transaction"))?;

    Ok(record)
}

fn insert_headers(
    tx: &rusqlite::Transaction<'_>,
    parent_column: &str,
    parent_id: i64,
    headers: &[(String, String)],
) -> Result<(), StorageError> {
    let sql = format!("INSERT INTO headers ({parent_column}, key, value) VALUES (?1, ?2, ?3)");
    let mut stmt = tx
        .prepare_cached(&sql)
        .map_err(StorageError::db("prepare insert header"))?;
    for (key, value) in headers {
        stmt.execute(params![parent_id, key, value])
            .map_err(StorageError::db("insert header"))?;
    }
    Ok(())
}

fn find_by_id_blocking(
    conn: &Connection,
    plan: &QueryPlan,
    id: i64,
) -> Result<RequestLog, StorageError> {
    let sql = plan.find_by_id_sql();
    let mut log = {
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(StorageError::db("prepare select request"))?;
        let mut rows = stmt
            .query(params![id])
            .map_err(StorageError::db("query request"))?;
        let Some(row) = rows.next().map_err(StorageError::db("read request row"))? else {
            return Err(StorageError::NotFound);
        };
        scan_request_row(row, plan)?
    };

    fetch_headers(conn, plan, std::slice::from_mut(&mut log))?;
    Ok(log)
}

fn find_all_blocking(conn: &Connection, plan: &QueryPlan) -> Result<Vec<RequestLog>, StorageError> {
    let sql = plan.find_all_sql();
    let mut logs = Vec::new();
    {
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(StorageError::db("prepare select requests"))?;
        let mut rows = stmt
            .query([])
            .map_err(StorageError::db("query requests"))?;
        while let Some(row) = rows.next().map_err(StorageError::db("iterate request rows"))? {
            logs.push(scan_request_row(row, plan)?);
        }
    }

    fetch_headers(conn, plan, &mut logs)?;
    Ok(logs)
}

fn scan_request_row(row: &rusqlite::Row<'_>, plan: &QueryPlan) -> Result<RequestLog, StorageError> {
    let mut log = RequestLog::default();
    let mut response = ResponseLog::default();
    let mut response_present = false;

    for (idx, column) in plan.columns.iter().enumerate() {
        match column {
            Column::ReqId => {
                log.id = row.get(idx).map_err(StorageError::db("scan req_id"))?;
            }
            Column::ResId => {
                if let Some(res_id) = row
                    .get::<_, Option<i64>>(idx)
                    .map_err(StorageError::db("scan res_id"))?
                {
                    response.id = res_id;
                    response_present = true;
                }
            }
            Column::ReqProto => {
                log.proto = row.get(idx).map_err(StorageError::db("scan req_proto"))?;
            }
            Column::ReqUrl => {
                log.url = row.get(idx).map_err(StorageError::db("scan url"))?;
            }
            Column::ReqMethod => {
                log.method = row.get(idx).map_err(StorageError::db("scan method"))?;
            }
            Column::ReqBody => {
                log.body = row.get(idx).map_err(StorageError::db("scan req_body"))?;
            }
            Column::ReqTimestamp => {
                log.timestamp = row
                    .get(idx)
                    .map_err(StorageError::db("scan req_timestamp"))?;
            }
            Column::ResReqId => {
                response.request_id = row
                    .get(idx)
                    .map_err(StorageError::db("scan res_req_id"))?;
            }
            Column::ResProto => {
                response.proto = row.get(idx).map_err(StorageError::db("scan res_proto"))?;
            }
            Column::ResStatusCode => {
                response.status_code = row
                    .get(idx)
                    .map_err(StorageError::db("scan status_code"))?;
            }
            Column::ResStatusReason => {
                response.status_reason = row
                    .get(idx)
                    .map_err(StorageError::db("scan status_reason"))?;
            }
            Column::ResBody => {
                response.body = row.get(idx).map_err(StorageError::db("scan res_body"))?;
            }
            Column::ResTimestamp => {
                response.timestamp = row
                    .get(idx)
                    .map_err(StorageError::db("scan res_timestamp"))?;
            }
        }
    }

    if response_present {
        log.response = Some(response);
    }
    Ok(log)
}

fn fetch_headers(
    conn: &Connection,
    plan: &QueryPlan,
    logs: &mut [RequestLog],
) -> Result<(), StorageError> {
    if let Some(sql) = plan.request_headers_sql() {
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(StorageError::db("prepare select request headers"))?;
        for log in logs.iter_mut() {
            log.headers = fetch_header_rows(&mut stmt, log.id, &plan.request_header_fields)?;
        }
    }

    if let Some(sql) = plan.response_headers_sql() {
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(StorageError::db("prepare select response headers"))?;
        for log in logs.iter_mut() {
            let Some(response) = log.response.as_mut() else {
                continue;
            };
            response.headers =
                fetch_header_rows(&mut stmt, response.id, &plan.response_header_fields)?;
        }
    }

    Ok(())
}

fn fetch_header_rows(
    stmt: &mut rusqlite::CachedStatement<'_>,
    parent_id: i64,
    fields: &[HeaderField],
) -> Result<Vec<(String, String)>, StorageError> {
    let mut rows = stmt
        .query(params![parent_id])
        .map_err(StorageError::db("query headers"))?;

    let mut headers = Vec::new();
    while let Some(row) = rows.next().map_err(StorageError::db("iterate header rows"))? {
        let mut key = String::new();
        let mut value = String::new();
        for (idx, field) in fields.iter().enumerate() {
            match field {
                HeaderField::Key => {
                    key = row.get(idx).map_err(StorageError::db("scan header key"))?;
                }
                HeaderField::Value => {
                    value = row
                        .get(idx)
                        .map_err(StorageError::db("scan header value"))?;
                }
            }
        }
        headers.push((key, value));
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone as _, Utc};
    use tokio_util::sync::CancellationToken;

    use super::{CapturedRequest, CapturedResponse, Storage, StorageError};
    use crate::projection::{HeaderField, Projection, RequestField, ResponseField};

    fn open_storage(dir: &tempfile::TempDir) -> Storage {
        Storage::open(dir.path().join("proxytap.db")).unwrap()
    }

    fn captured_get(url: &str, headers: Vec<(&str, &str)>, body: &[u8]) -> CapturedRequest {
        CapturedRequest {
            method: hyper::Method::GET,
            url: url.parse().unwrap(),
            version: hyper::Version::HTTP_11,
            headers: headers
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
            body: Bytes::copy_from_slice(body),
        }
    }

    fn captured_response(status: u16, headers: Vec<(&str, &str)>, body: &[u8]) -> CapturedResponse {
        CapturedResponse {
            version: hyper::Version::HTTP_11,
            status: hyper::StatusCode::from_u16(status).unwrap(),
            headers: headers
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
            body: Bytes::copy_from_slice(body),
        }
    }

    fn ts(micros: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::microseconds(micros)
    }

    #[tokio::test]
    async fn add_request_round_trips_through_full_projection() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let req = captured_get(
            "http://x.test/a?q=1",
            vec![("H", "1"), ("H", "2"), ("Content-Type", "text/plain")],
            b"\x00\x01\xffbody",
        );
        let added = storage.add_request(&req, ts(7), &cancel).await.unwrap();
        assert!(added.id > 0);

        let found = storage
            .find_by_id(added.id, &Projection::full(), &cancel)
            .await
            .unwrap();
        assert_eq!(found, added);
        assert_eq!(found.url.as_deref(), Some("http://x.test/a?q=1"));
        assert_eq!(found.proto.as_deref(), Some("HTTP/1.1"));
        assert_eq!(found.body.as_deref(), Some(&b"\x00\x01\xffbody"[..]));
        assert_eq!(found.timestamp, Some(ts(7)));
        assert_eq!(
            found.headers,
            vec![
                ("H".to_owned(), "1".to_owned()),
                ("H".to_owned(), "2".to_owned()),
                ("Content-Type".to_owned(), "text/plain".to_owned()),
            ]
        );
        assert!(found.response.is_none());
    }

    #[tokio::test]
    async fn add_response_attaches_with_code_and_reason_split() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let req = captured_get("http://x.test/a", vec![], b"");
        let added = storage.add_request(&req, ts(0), &cancel).await.unwrap();

        let res = captured_response(200, vec![("Content-Type", "text/plain")], b"hi");
        let added_res = storage
            .add_response(added.id, &res, ts(1), &cancel)
            .await
            .unwrap();
        assert!(added_res.id > 0);
        assert_eq!(added_res.status_reason.as_deref(), Some("OK"));

        let found = storage
            .find_by_id(added.id, &Projection::full(), &cancel)
            .await
            .unwrap();
        let response = found.response.expect("response should be attached");
        assert_eq!(response.request_id, Some(added.id));
        assert_eq!(response.status_code, Some(200));
        assert_eq!(response.status_reason.as_deref(), Some("OK"));
        assert_eq!(response.body.as_deref(), Some(&b"hi"[..]));
        assert_eq!(
            response.headers,
            vec![("Content-Type".to_owned(), "text/plain".to_owned())]
        );
    }

    #[tokio::test]
    async fn narrow_projection_populates_only_requested_fields() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let req = captured_get("http://x.test/a", vec![("H", "1")], b"body");
        let added = storage.add_request(&req, ts(0), &cancel).await.unwrap();

        let projection = Projection::new().request_field(RequestField::Url);
        let found = storage
            .find_by_id(added.id, &projection, &cancel)
            .await
            .unwrap();

        assert_eq!(found.id, added.id);
        assert_eq!(found.url.as_deref(), Some("http://x.test/a"));
        assert!(found.method.is_none());
        assert!(found.proto.is_none());
        assert!(found.body.is_none());
        assert!(found.timestamp.is_none());
        assert!(found.headers.is_empty());
        assert!(found.response.is_none());
    }

    #[tokio::test]
    async fn find_all_returns_strictly_descending_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        for n in 0..5 {
            let req = captured_get(&format!("http://x.test/{n}"), vec![], b"");
            storage.add_request(&req, ts(n), &cancel).await.unwrap();
        }

        let logs = storage
            .find_all(&Projection::new().request_field(RequestField::Url), &cancel)
            .await
            .unwrap();
        assert_eq!(logs.len(), 5);
        assert!(
            logs.windows(2).all(|pair| pair[0].id > pair[1].id),
            "ids should strictly descend: {:?}",
            logs.iter().map(|log| log.id).collect::<Vec<_>>()
        );
        assert_eq!(logs[0].url.as_deref(), Some("http://x.test/4"));
        assert_eq!(logs[4].url.as_deref(), Some("http://x.test/0"));
    }

    #[tokio::test]
    async fn find_by_id_for_missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let err = storage
            .find_by_id(42, &Projection::full(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound), "{err}");
    }

    #[tokio::test]
    async fn response_for_missing_request_violates_foreign_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let res = captured_response(204, vec![], b"");
        let err = storage
            .add_response(999, &res, ts(0), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Database { .. }), "{err}");
    }

    #[tokio::test]
    async fn delete_request_cascades_to_response_and_header_rows() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let req = captured_get("http://x.test/a", vec![("H", "1")], b"");
        let added = storage.add_request(&req, ts(0), &cancel).await.unwrap();
        let res = captured_response(200, vec![("Set-Cookie", "a=1")], b"ok");
        storage
            .add_response(added.id, &res, ts(1), &cancel)
            .await
            .unwrap();

        assert!(storage.delete_request(added.id, &cancel).await.unwrap());
        assert!(!storage.delete_request(added.id, &cancel).await.unwrap());

        let conn = rusqlite::Connection::open(storage.db_path()).unwrap();
        for table in ["requests", "responses", "headers"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty after cascade");
        }
    }

    #[tokio::test]
    async fn wipe_clears_every_table() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        for n in 0..3 {
            let req = captured_get(&format!("http://x.test/{n}"), vec![("H", "1")], b"");
            let added = storage.add_request(&req, ts(n), &cancel).await.unwrap();
            let res = captured_response(200, vec![], b"");
            storage
                .add_response(added.id, &res, ts(n), &cancel)
                .await
                .unwrap();
        }

        storage.wipe(&cancel).await.unwrap();
        let logs = storage.find_all(&Projection::full(), &cancel).await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn empty_and_duplicate_header_keys_are_preserved_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let req = captured_get(
            "http://x.test/a",
            vec![("", "anonymous"), ("X-Dup", "first"), ("X-Dup", "first")],
            b"",
        );
        let added = storage.add_request(&req, ts(0), &cancel).await.unwrap();

        let found = storage
            .find_by_id(added.id, &Projection::full(), &cancel)
            .await
            .unwrap();
        assert_eq!(
            found.headers,
            vec![
                ("".to_owned(), "anonymous".to_owned()),
                ("X-Dup".to_owned(), "first".to_owned()),
                ("X-Dup".to_owned(), "first".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_add_requests_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let req_a = captured_get("http://x.test/a", vec![], b"");
        let req_b = captured_get("http://x.test/b", vec![], b"");
        let (a, b) = tokio::join!(
            storage.add_request(&req_a, ts(0), &cancel),
            storage.add_request(&req_b, ts(1), &cancel),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.id, b.id);
        let logs = storage.find_all(&Projection::full(), &cancel).await.unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_write_leaves_the_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let req = captured_get("http://x.test/a", vec![("H", "1")], b"");
        let err = storage
            .add_request(&req, ts(0), &cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled), "{err}");

        let conn = rusqlite::Connection::open(storage.db_path()).unwrap();
        for table in ["requests", "headers"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty after cancellation");
        }
    }

    #[tokio::test]
    async fn response_projection_subset_narrows_response_fields() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&dir);
        let cancel = CancellationToken::new();

        let req = captured_get("http://x.test/a", vec![], b"");
        let added = storage.add_request(&req, ts(0), &cancel).await.unwrap();
        let res = captured_response(404, vec![("X-Trace", "t1")], b"gone");
        storage
            .add_response(added.id, &res, ts(1), &cancel)
            .await
            .unwrap();

        let projection = Projection::new()
            .response_field(ResponseField::StatusCode)
            .response_headers(&[HeaderField::Key]);
        let found = storage
            .find_by_id(added.id, &projection, &cancel)
            .await
            .unwrap();

        let response = found.response.expect("response should be present");
        assert_eq!(response.status_code, Some(404));
        assert!(response.status_reason.is_none());
        assert!(response.body.is_none());
        assert_eq!(response.headers, vec![("X-Trace".to_owned(), String::new())]);
    }

    #[test]
    fn status_reason_is_the_line_past_the_code() {
        assert_eq!(super::status_reason("200 OK"), "OK");
        assert_eq!(super::status_reason("404 Not Found"), "Not Found");
        assert_eq!(super::status_reason("204 "), "");
        assert_eq!(super::status_reason("204"), "");
        assert_eq!(super::status_reason(""), "");
    }
}
