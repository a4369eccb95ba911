//! Attack Detector
//!
//! Regex-based XSS and SQL injection detection plus a header-presence CSRF
//! check. Patterns are compiled once when the detector is built and shared
//! read-only by every analysis.
//!
//! The body is matched as received, the URL after percent-decoding. A
//! rewritten URL is therefore always the decoded form.

use regex::Regex;
use std::collections::HashMap;

use super::{ActionType, AttackType, ScanResult, CSRF_TOKEN_HEADER};

const SQLI_PATTERN: &str = r#"(?i)(\b(select|insert|update|delete|drop|union|join|cast|create|alter|truncate|grant|revoke|nullif|execute)\b[\s\S]*?['";\-\+=])|(\b(or|and)\b\s+('[^']*'|\d+)\s*=\s*('[^']*'|\d+))|(--|#)|(;[\s]*(select|insert|update|delete|drop|create|alter|truncate))|(%27|%2D%2D|%23)"#;
const XSS_PATTERN: &str = r"(?i)<script.*?>.*?</script>";

pub const REASON_XSS: &str = "XSS detected in request.";
pub const REASON_SQLI: &str = "SQL injection detected in request.";
pub const REASON_CSRF: &str = "Missing CSRF token.";

/// The part of a request detectors look at
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    pub url: &'a str,
    pub body: &'a str,
    pub headers: &'a HashMap<String, String>,
}

impl<'a> DetectionInput<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Outcome of a single detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub action: ActionType,
    pub modified_url: Option<String>,
    pub modified_body: Option<String>,
    pub reason: String,
}

impl From<Verdict> for ScanResult {
    fn from(verdict: Verdict) -> Self {
        ScanResult {
            action: verdict.action,
            modified_url: verdict.modified_url,
            modified_body: verdict.modified_body,
            reason: verdict.reason,
        }
    }
}

/// A single attack check.
///
/// Returns `None` when nothing was detected. `action` is the remediation the
/// rule asks for; detectors may ignore it.
pub trait Detect: Send + Sync {
    fn detect(&self, input: &DetectionInput<'_>, action: ActionType) -> Option<Verdict>;
}

/// Pattern match + rewrite shared by the XSS and SQLi detectors
struct PatternDetector {
    pattern: Regex,
    escape: fn(&str) -> String,
    reason: &'static str,
}

impl PatternDetector {
    fn new(pattern: &str, escape: fn(&str) -> String, reason: &'static str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            escape,
            reason,
        })
    }

    fn rewrite(&self, input: &str, action: ActionType) -> String {
        match action {
            ActionType::Sanitize => self.pattern.replace_all(input, "").into_owned(),
            ActionType::Escape => (self.escape)(input),
            ActionType::Block | ActionType::Allow => input.to_string(),
        }
    }

    fn scan(&self, input: &DetectionInput<'_>, action: ActionType) -> Option<Verdict> {
        let decoded_url = decode_url(input.url);
        let body_hit = self.pattern.is_match(input.body);
        let url_hit = self.pattern.is_match(&decoded_url);

        if !body_hit && !url_hit {
            return None;
        }

        let mut verdict = Verdict {
            action,
            modified_url: None,
            modified_body: None,
            reason: self.reason.to_string(),
        };

        if action == ActionType::Block {
            return Some(verdict);
        }

        if body_hit {
            let body = self.rewrite(input.body, action);
            if body != input.body {
                verdict.modified_body = Some(body);
            }
        }

        if url_hit {
            let url = self.rewrite(&decoded_url, action);
            if url != input.url {
                verdict.modified_url = Some(url);
            }
        }

        Some(verdict)
    }
}

/// `<script>` tag detection
pub struct XssDetector {
    inner: PatternDetector,
}

impl XssDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            inner: PatternDetector::new(XSS_PATTERN, escape_html, REASON_XSS)?,
        })
    }
}

impl Detect for XssDetector {
    fn detect(&self, input: &DetectionInput<'_>, action: ActionType) -> Option<Verdict> {
        self.inner.scan(input, action)
    }
}

/// SQL keyword, tautology and comment-marker detection
pub struct SqliDetector {
    inner: PatternDetector,
}

impl SqliDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            inner: PatternDetector::new(SQLI_PATTERN, escape_sql, REASON_SQLI)?,
        })
    }
}

impl Detect for SqliDetector {
    fn detect(&self, input: &DetectionInput<'_>, action: ActionType) -> Option<Verdict> {
        self.inner.scan(input, action)
    }
}

/// Blocks requests without an anti-CSRF token. The rule's action is not
/// consulted.
#[derive(Debug, Default)]
pub struct CsrfDetector;

impl Detect for CsrfDetector {
    fn detect(&self, input: &DetectionInput<'_>, _action: ActionType) -> Option<Verdict> {
        match input.header(CSRF_TOKEN_HEADER) {
            Some(token) if !token.is_empty() => None,
            _ => Some(Verdict {
                action: ActionType::Block,
                modified_url: None,
                modified_body: None,
                reason: REASON_CSRF.to_string(),
            }),
        }
    }
}

/// All detectors, addressed by attack type
pub struct AttackDetector {
    xss: XssDetector,
    sqli: SqliDetector,
    csrf: CsrfDetector,
}

impl AttackDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            xss: XssDetector::new()?,
            sqli: SqliDetector::new()?,
            csrf: CsrfDetector,
        })
    }

    /// Detector for `attack`, `None` for attack types without one
    pub fn detector_for(&self, attack: &AttackType) -> Option<&dyn Detect> {
        match attack {
            AttackType::Xss => Some(&self.xss),
            AttackType::Sqli => Some(&self.sqli),
            AttackType::Csrf => Some(&self.csrf),
            AttackType::Unrecognized(_) => None,
        }
    }

    pub fn detect(
        &self,
        attack: &AttackType,
        input: &DetectionInput<'_>,
        action: ActionType,
    ) -> Option<Verdict> {
        self.detector_for(attack)?.detect(input, action)
    }
}

/// HTML-entity encode `< > " ' &` in a single pass
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '&' => escaped.push_str("&amp;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Double every single quote
pub fn escape_sql(input: &str) -> String {
    input.replace('\'', "''")
}

/// Query-string decoding: `+` is a space, malformed escapes stay literal,
/// and bytes that are not UTF-8 decode lossily
pub fn decode_url(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    let bytes = urlencoding::decode_binary(spaced.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}
