//! Rules Engine Types
//!
//! Policy entities (resources, rules, IP lists and their associations), the
//! tri-state active flag, remediation actions, analyzer input/output and the
//! error taxonomy shared by every rules engine component.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// List type that turns containment into a block
pub const BLACKLIST: &str = "blacklist";

/// Header carrying the anti-CSRF token
pub const CSRF_TOKEN_HEADER: &str = "X-Csrf-Token";

// =============================================================================
// ACTIVE FLAG
// =============================================================================

/// Tri-state activation flag.
///
/// `Unset` means the caller never supplied a value (missing field or JSON
/// `null`), which is different from an explicit `false`. Partial updates only
/// overwrite the stored flag when the incoming flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum ActiveFlag {
    #[default]
    Unset,
    Enabled,
    Disabled,
}

impl ActiveFlag {
    /// Whether the caller supplied a value
    pub fn is_set(&self) -> bool {
        !matches!(self, ActiveFlag::Unset)
    }

    /// Only an explicit `true` counts as active
    pub fn is_enabled(&self) -> bool {
        matches!(self, ActiveFlag::Enabled)
    }
}

impl From<Option<bool>> for ActiveFlag {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => ActiveFlag::Unset,
            Some(true) => ActiveFlag::Enabled,
            Some(false) => ActiveFlag::Disabled,
        }
    }
}

impl From<bool> for ActiveFlag {
    fn from(value: bool) -> Self {
        ActiveFlag::from(Some(value))
    }
}

impl From<ActiveFlag> for Option<bool> {
    fn from(flag: ActiveFlag) -> Self {
        match flag {
            ActiveFlag::Unset => None,
            ActiveFlag::Enabled => Some(true),
            ActiveFlag::Disabled => Some(false),
        }
    }
}

// =============================================================================
// ACTIONS AND ATTACK TYPES
// =============================================================================

/// Remediation applied when a rule detects an attack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Reject the request
    Block,
    /// Remove the offending fragments
    Sanitize,
    /// Neutralize the offending characters
    Escape,
    /// Let the request through untouched
    Allow,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Block => "block",
            ActionType::Sanitize => "sanitize",
            ActionType::Escape => "escape",
            ActionType::Allow => "allow",
        }
    }

    /// Sanitize and escape rewrite the payload, block and allow never do
    pub fn rewrites_payload(&self) -> bool {
        matches!(self, ActionType::Sanitize | ActionType::Escape)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(ActionType::Block),
            "sanitize" => Ok(ActionType::Sanitize),
            "escape" => Ok(ActionType::Escape),
            "allow" => Ok(ActionType::Allow),
            _ => Err(PolicyError::ValidationFailed(format!(
                "unknown action type: {}",
                s
            ))),
        }
    }
}

/// Attack family a rule targets.
///
/// Attack types are free-form on the wire. Values the analyzer has no detector
/// for are kept verbatim as `Unrecognized` so they round-trip through the
/// store and are skipped at analysis time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttackType {
    Xss,
    Sqli,
    Csrf,
    Unrecognized(String),
}

impl AttackType {
    pub fn as_str(&self) -> &str {
        match self {
            AttackType::Xss => "xss",
            AttackType::Sqli => "sqli",
            AttackType::Csrf => "csrf",
            AttackType::Unrecognized(raw) => raw,
        }
    }
}

impl From<&str> for AttackType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "xss" => AttackType::Xss,
            "sqli" => AttackType::Sqli,
            "csrf" => AttackType::Csrf,
            _ => AttackType::Unrecognized(value.to_string()),
        }
    }
}

impl From<String> for AttackType {
    fn from(value: String) -> Self {
        AttackType::from(value.as_str())
    }
}

impl From<AttackType> for String {
    fn from(attack: AttackType) -> Self {
        match attack {
            AttackType::Unrecognized(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// A protected upstream endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub http_method: String,
    /// Exact path, no wildcard semantics
    pub url: String,
    /// Upstream host the proxy forwards to
    pub host: String,
    pub creator_id: String,
    #[serde(default)]
    pub is_active: ActiveFlag,
    /// Unix seconds
    pub created_at: u64,
}

/// A detection + remediation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub attack_type: AttackType,
    pub action_type: ActionType,
    #[serde(default)]
    pub is_active: ActiveFlag,
    pub creator_id: String,
    pub created_at: u64,
}

/// A CIDR-qualified address range attachable to resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpList {
    pub id: String,
    /// Network address, always stored normalized
    #[serde(with = "cidr_string")]
    pub ip: IpNetwork,
    pub list_type: String,
    pub creator_id: String,
    pub created_at: u64,
}

impl IpList {
    pub fn is_blacklist(&self) -> bool {
        self.list_type == BLACKLIST
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.ip.contains(addr)
    }
}

/// Which link table an association lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    Rule,
    IpList,
}

/// Link between a resource and a rule or IP list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub id: String,
    pub kind: AssociationKind,
    pub resource_id: String,
    pub target_id: String,
    pub created_at: u64,
}

impl Association {
    pub fn new(kind: AssociationKind, resource_id: &str, target_id: &str) -> Self {
        Self {
            id: generate_id("link"),
            kind,
            resource_id: resource_id.to_string(),
            target_id: target_id.to_string(),
            created_at: current_timestamp(),
        }
    }
}

/// Resource listing entry with its attached policies joined in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceWithPolicies {
    #[serde(flatten)]
    pub resource: Resource,
    pub rules: Vec<Rule>,
    pub ip_lists: Vec<IpList>,
}

// =============================================================================
// ANALYZER INPUT / OUTPUT
// =============================================================================

/// Normalized description of an inbound request, as forwarded by the proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    /// Requester address, optionally with a port suffix
    pub ip: String,
    pub method: String,
    /// Path plus optional query string
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
}

/// Treats an explicit JSON `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl AnalyzeRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Verdict returned to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub action: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_body: Option<String>,
    pub reason: String,
}

impl ScanResult {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            action: ActionType::Allow,
            modified_url: None,
            modified_body: None,
            reason: reason.into(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            action: ActionType::Block,
            modified_url: None,
            modified_body: None,
            reason: reason.into(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.action == ActionType::Block
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Entity named in a `NotFound` error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Resource,
    Rule,
    IpList,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Resource => write!(f, "Resource"),
            EntityKind::Rule => write!(f, "Rule"),
            EntityKind::IpList => write!(f, "IP list"),
        }
    }
}

/// Analyzer phase a store failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisPhase {
    IpListLookup,
    RuleLookup,
}

impl fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisPhase::IpListLookup => write!(f, "ip list lookup"),
            AnalysisPhase::RuleLookup => write!(f, "rule lookup"),
        }
    }
}

/// Rules engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("{entity} not found: id={id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Analysis failed during {phase}: {message}")]
    Analysis { phase: AnalysisPhase, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl PolicyError {
    pub fn not_found(entity: EntityKind, id: &str) -> Self {
        PolicyError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Parse a CIDR string and mask it down to its network address.
///
/// A prefix length is mandatory: a bare address is rejected.
pub fn parse_cidr(input: &str) -> Result<IpNetwork, PolicyError> {
    let trimmed = input.trim();
    if !trimmed.contains('/') {
        return Err(PolicyError::InvalidCidr(input.to_string()));
    }

    let network =
        IpNetwork::from_str(trimmed).map_err(|_| PolicyError::InvalidCidr(input.to_string()))?;

    IpNetwork::new(network.network(), network.prefix())
        .map_err(|_| PolicyError::InvalidCidr(input.to_string()))
}

mod cidr_string {
    use ipnetwork::IpNetwork;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(network: &IpNetwork, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(network)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IpNetwork, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_cidr(&raw).map_err(serde::de::Error::custom)
    }
}

/// Current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate an opaque entity id with a type prefix
pub fn generate_id(prefix: &str) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    format!("{}_{}", prefix, hex::encode(bytes))
}
