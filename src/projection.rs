//! Field projections and the query plans derived from them.
//!
//! Callers describe which record fields they want populated (typically the
//! field tree their own API layer collected); the planner turns that into a
//! column list, a join decision, and the follow-up header queries. The store
//! only ever sees the resulting [`QueryPlan`].

/// One node of a caller-supplied field tree: a field name plus optional
/// nested selections. Unknown names are ignored so an API layer can forward
/// its query AST verbatim.
#[derive(Debug, Clone)]
pub struct FieldSelection {
    pub name: String,
    pub children: Vec<FieldSelection>,
}

impl FieldSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(name: impl Into<String>, children: Vec<FieldSelection>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestField {
    Proto,
    Url,
    Method,
    Body,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseField {
    RequestId,
    Proto,
    StatusCode,
    StatusReason,
    Body,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Key,
    Value,
}

/// The set of logical fields a query wants populated in returned records.
///
/// `req.id` is always fetched (and `res.id` whenever the response side is
/// touched) regardless of the selection; header fetches need them.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    request_fields: Vec<RequestField>,
    request_header_fields: Vec<HeaderField>,
    response: bool,
    response_fields: Vec<ResponseField>,
    response_header_fields: Vec<HeaderField>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects every request, response, and header field.
    pub fn full() -> Self {
        Self::new()
            .request_field(RequestField::Proto)
            .request_field(RequestField::Url)
            .request_field(RequestField::Method)
            .request_field(RequestField::Body)
            .request_field(RequestField::Timestamp)
            .request_headers(&[HeaderField::Key, HeaderField::Value])
            .response_field(ResponseField::RequestId)
            .response_field(ResponseField::Proto)
            .response_field(ResponseField::StatusCode)
            .response_field(ResponseField::StatusReason)
            .response_field(ResponseField::Body)
            .response_field(ResponseField::Timestamp)
            .response_headers(&[HeaderField::Key, HeaderField::Value])
    }

    /// Builds a projection from a field tree, ignoring unrecognized names.
    ///
    /// Recognized request fields: `proto`, `url`, `method`, `body`,
    /// `timestamp`, `headers` (with `key`/`value` children) and `response`.
    /// Response children additionally accept `requestId`, `statusCode` and
    /// `statusReason`. Selecting `response` with no children still forces the
    /// response join so callers can observe presence.
    pub fn from_selections(fields: &[FieldSelection]) -> Self {
        let mut projection = Self::new();

        for field in fields {
            if let Some(request_field) = request_field_for(&field.name) {
                projection = projection.request_field(request_field);
            }
            if field.name == "headers" {
                let header_fields = header_fields_for(&field.children);
                projection = projection.request_headers(&header_fields);
            }
            if field.name == "response" {
                projection.response = true;
                for response_field in &field.children {
                    if let Some(mapped) = response_field_for(&response_field.name) {
                        projection = projection.response_field(mapped);
                    }
                    if response_field.name == "headers" {
                        let header_fields = header_fields_for(&response_field.children);
                        projection = projection.response_headers(&header_fields);
                    }
                }
            }
        }

        projection
    }

    pub fn request_field(mut self, field: RequestField) -> Self {
        if !self.request_fields.contains(&field) {
            self.request_fields.push(field);
        }
        self
    }

    pub fn request_headers(mut self, fields: &[HeaderField]) -> Self {
        for field in fields {
            if !self.request_header_fields.contains(field) {
                self.request_header_fields.push(*field);
            }
        }
        self
    }

    /// Selects the response side without any of its fields; presence of a
    /// response is still observable on returned records.
    pub fn response(mut self) -> Self {
        self.response = true;
        self
    }

    pub fn response_field(mut self, field: ResponseField) -> Self {
        self.response = true;
        if !self.response_fields.contains(&field) {
            self.response_fields.push(field);
        }
        self
    }

    pub fn response_headers(mut self, fields: &[HeaderField]) -> Self {
        self.response = true;
        for field in fields {
            if !self.response_header_fields.contains(field) {
                self.response_header_fields.push(*field);
            }
        }
        self
    }

    pub(crate) fn plan(&self) -> QueryPlan {
        let mut columns = vec![Column::ReqId];
        if self.response {
            columns.push(Column::ResId);
        }
        for field in &self.request_fields {
            columns.push(field.column());
        }
        if self.response {
            for field in &self.response_fields {
                columns.push(field.column());
            }
        }

        QueryPlan {
            columns,
            join_response: self.response,
            request_header_fields: self.request_header_fields.clone(),
            response_header_fields: self.response_header_fields.clone(),
        }
    }
}

impl RequestField {
    fn column(self) -> Column {
        match self {
            Self::Proto => Column::ReqProto,
            Self::Url => Column::ReqUrl,
            Self::Method => Column::ReqMethod,
            Self::Body => Column::ReqBody,
            Self::Timestamp => Column::ReqTimestamp,
        }
    }
}

impl ResponseField {
    fn column(self) -> Column {
        match self {
            Self::RequestId => Column::ResReqId,
            Self::Proto => Column::ResProto,
            Self::StatusCode => Column::ResStatusCode,
            Self::StatusReason => Column::ResStatusReason,
            Self::Body => Column::ResBody,
            Self::Timestamp => Column::ResTimestamp,
        }
    }
}

fn request_field_for(name: &str) -> Option<RequestField> {
    match name {
        "proto" => Some(RequestField::Proto),
        "url" => Some(RequestField::Url),
        "method" => Some(RequestField::Method),
        "body" => Some(RequestField::Body),
        "timestamp" => Some(RequestField::Timestamp),
        _ => None,
    }
}

fn response_field_for(name: &str) -> Option<ResponseField> {
    match name {
        "requestId" => Some(ResponseField::RequestId),
        "proto" => Some(ResponseField::Proto),
        "statusCode" => Some(ResponseField::StatusCode),
        "statusReason" => Some(ResponseField::StatusReason),
        "body" => Some(ResponseField::Body),
        "timestamp" => Some(ResponseField::Timestamp),
        _ => None,
    }
}

fn header_fields_for(children: &[FieldSelection]) -> Vec<HeaderField> {
    let mut fields = Vec::new();
    for child in children {
        let mapped = match child.name.as_str() {
            "key" => HeaderField::Key,
            "value" => HeaderField::Value,
            _ => continue,
        };
        if !fields.contains(&mapped) {
            fields.push(mapped);
        }
    }
    fields
}

/// A physical column of the base query, in selection order. The scan side
/// walks the same list, so the plan is the single source of column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Column {
    ReqId,
    ResId,
    ReqProto,
    ReqUrl,
    ReqMethod,
    ReqBody,
    ReqTimestamp,
    ResReqId,
    ResProto,
    ResStatusCode,
    ResStatusReason,
    ResBody,
    ResTimestamp,
}

impl Column {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            Self::ReqId => "req.id AS req_id",
            Self::ResId => "res.id AS res_id",
            Self::ReqProto => "req.proto AS req_proto",
            Self::ReqUrl => "req.url",
            Self::ReqMethod => "req.method",
            Self::ReqBody => "req.body AS req_body",
            Self::ReqTimestamp => "req.timestamp AS req_timestamp",
            Self::ResReqId => "res.req_id AS res_req_id",
            Self::ResProto => "res.proto AS res_proto",
            Self::ResStatusCode => "res.status_code",
            Self::ResStatusReason => "res.status_reason",
            Self::ResBody => "res.body AS res_body",
            Self::ResTimestamp => "res.timestamp AS res_timestamp",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueryPlan {
    pub(crate) columns: Vec<Column>,
    pub(crate) join_response: bool,
    pub(crate) request_header_fields: Vec<HeaderField>,
    pub(crate) response_header_fields: Vec<HeaderField>,
}

impl QueryPlan {
    pub(crate) fn find_all_sql(&self) -> String {
        let mut sql = self.base_select();
        sql.push_str(" ORDER BY req.id DESC");
        sql
    }

    pub(crate) fn find_by_id_sql(&self) -> String {
        let mut sql = self.base_select();
        sql.push_str(" WHERE req.id = ?1");
        sql
    }

    fn base_select(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| column.sql())
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT {columns} FROM requests req");
        if self.join_response {
            sql.push_str(" LEFT JOIN responses res ON req.id = res.req_id");
        }
        sql
    }

    pub(crate) fn request_headers_sql(&self) -> Option<String> {
        header_select_sql(&self.request_header_fields, "req_id")
    }

    pub(crate) fn response_headers_sql(&self) -> Option<String> {
        header_select_sql(&self.response_header_fields, "res_id")
    }
}

fn header_select_sql(fields: &[HeaderField], parent_column: &str) -> Option<String> {
    if fields.is_empty() {
        return None;
    }
    let columns = fields
        .iter()
        .map(|field| match field {
            HeaderField::Key => "key",
            HeaderField::Value => "value",
        })
        .collect::<Vec<_>>()
        .join(", ");
    // Rows come back in insertion order so duplicate keys keep their order.
    Some(format!(
        "SELECT {columns} FROM headers WHERE {parent_column} = ?1 ORDER BY id"
    ))
}
