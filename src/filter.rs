//! Search filters applied to request logs after they leave the store.
//!
//! Grammar: a filter is zero or more whitespace-separated `key:value`
//! clauses, AND-ed together. Keys are `method`, `url`, `proto`, `status` and
//! `body`; values may be double-quoted to contain whitespace. The empty
//! string is the always-true filter. Anything else fails to parse.

use crate::storage::RequestLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterParseError {
    message: String,
}

impl FilterParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FilterParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FilterParseError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    Method(String),
    Url(String),
    Proto(String),
    Status(u16),
    Body(String),
}

/// A parsed filter expression; a predicate over request logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, FilterParseError> {
        let mut clauses = Vec::new();
        let mut rest = input.trim_start();

        while !rest.is_empty() {
            let (clause, remainder) = parse_clause(rest)?;
            clauses.push(clause);
            rest = remainder.trim_start();
        }

        Ok(Self { clauses })
    }

    /// Evaluates the predicate against a record as the store returned it.
    /// Clauses over unpopulated fields do not match.
    pub fn matches(&self, log: &RequestLog) -> bool {
        self.clauses.iter().all(|clause| clause.matches(log))
    }
}

impl Clause {
    fn matches(&self, log: &RequestLog) -> bool {
        match self {
            Self::Method(wanted) => log
                .method
                .as_deref()
                .is_some_and(|method| method.eq_ignore_ascii_case(wanted)),
            Self::Url(needle) => log.url.as_deref().is_some_and(|url| url.contains(needle)),
            Self::Proto(wanted) => log.proto.as_deref() == Some(wanted.as_str()),
            Self::Status(wanted) => log
                .response
                .as_ref()
                .and_then(|response| response.status_code)
                == Some(*wanted),
            Self::Body(needle) => log
                .body
                .as_deref()
                .is_some_and(|body| String::from_utf8_lossy(body).contains(needle)),
        }
    }
}

fn parse_clause(input: &str) -> Result<(Clause, &str), FilterParseError> {
    let Some(colon) = input.find(':') else {
        let token = input.split_whitespace().next().unwrap_or(input);
        return Err(FilterParseError::new(format!(
            "unrecognized filter token `{token}`"
        )));
    };
    let key = &input[..colon];
    if key.contains(char::is_whitespace) || key.is_empty() {
        let token = input.split_whitespace().next().unwrap_or(input);
        return Err(FilterParseError::new(format!(
            "unrecognized filter token `{token}`"
        )));
    }

    let (value, rest) = parse_value(&input[colon + 1..])?;
    if value.is_empty() {
        return Err(FilterParseError::new(format!(
            "filter field `{key}` is missing a value"
        )));
    }

    let clause = match key {
        "method" => Clause::Method(value),
        "url" => Clause::Url(value),
        "proto" => Clause::Proto(value),
        "status" => {
            let code = value.parse::<u16>().map_err(|_| {
                FilterParseError::new(format!("status value `{value}` is not a status code"))
            })?;
            Clause::Status(code)
        }
        "body" => Clause::Body(value),
        _ => {
            return Err(FilterParseError::new(format!(
                "unrecognized filter field `{key}`"
            )));
        }
    };

    Ok((clause, rest))
}

fn parse_value(input: &str) -> Result<(String, &str), FilterParseError> {
    if let Some(quoted) = input.strip_prefix('"') {
        let Some(end) = quoted.find('"') else {
            return Err(FilterParseError::new(
                "unterminated quote in filter value".to_owned(),
            ));
        };
        return Ok((quoted[..end].to_owned(), &quoted[end + 1..]));
    }

    let end = input
        .find(|c: char| c.is_whitespace())
        .unwrap_or(input.len());
    Ok((input[..end].to_owned(), &input[end..]))
}
