use regex::Regex;

use crate::config::ScopeRuleConfig;

/// Decides which observed traffic is worth logging.
///
/// A scope is an ordered rule list; a request is in scope when any rule
/// matches. A rule is a disjunction of regex checks over the url, a header
/// pair, or the body. An empty scope matches everything.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
struct Rule {
    url: Option<Regex>,
    header_key: Option<Regex>,
    header_value: Option<Regex>,
    body: Option<Regex>,
}

#[derive(Debug)]
pub struct ScopeError {
    pattern: String,
    source: regex::Error,
}

impl std::fmt::Display for ScopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compile scope pattern `{}`: {}", self.pattern, self.source)
    }
}

impl std::error::Error for ScopeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl Scope {
    /// A scope with no rules; every request is in scope.
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn from_config(rules: &[ScopeRuleConfig]) -> Result<Self, ScopeError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push(Rule {
                url: compile(rule.url.as_deref())?,
                header_key: compile(rule.header.as_ref().and_then(|h| h.key.as_deref()))?,
                header_value: compile(rule.header.as_ref().and_then(|h| h.value.as_deref()))?,
                body: compile(rule.body.as_deref())?,
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn permits(&self, url: &str, headers: &[(String, String)], body: &[u8]) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let body = String::from_utf8_lossy(body);
        self.rules
            .iter()
            .any(|rule| rule.matches(url, headers, &body))
    }
}

impl Rule {
    fn matches(&self, url: &str, headers: &[(String, String)], body: &str) -> bool {
        if let Some(url_re) = &self.url
            && url_re.is_match(url)
        {
            return true;
        }
        if (self.header_key.is_some() || self.header_value.is_some())
            && headers.iter().any(|(key, value)| {
                self.header_key.as_ref().is_none_or(|re| re.is_match(key))
                    && self.header_value.as_ref().is_none_or(|re| re.is_match(value))
            })
        {
            return true;
        }
        if let Some(body_re) = &self.body
            && body_re.is_match(body)
        {
            return true;
        }
        false
    }
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, ScopeError> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| ScopeError {
            pattern: pattern.to_owned(),
            source,
        })
}
