//! AEGIS Rules Engine
//!
//! Policy decisions for the API gateway: which requests reach an upstream,
//! which are rejected, and which are rewritten on the way through.
//!
//! ## Architecture
//!
//! ```text
//! Proxy → /analyze → Request Analyzer → IP Policy (allow/block)
//!                          ↓
//!                    Attack Detector (xss, sqli, csrf)
//!                          ↓
//!                    ScanResult (allow | block | sanitize | escape)
//!
//! Admin → HTTP API → Auth Client → Policy Model / Associations
//!                          ↓
//!                    Policy Store (in-memory or SQLite)
//! ```
//!
//! ## Components
//!
//! - `rules_types`: entities, scan results, error types and shared helpers
//! - `policy_store`: storage traits and the in-memory store
//! - `rules_persistence`: SQLite-backed store
//! - `policy_model`: validated create/update/list of resources, rules, IP lists
//! - `associations`: attach/detach rules and IP lists to resources
//! - `ip_policy`: requester address evaluation against IP lists
//! - `attack_detector`: XSS, SQL injection and CSRF detection and rewriting
//! - `request_analyzer`: combined verdict for one inbound request
//! - `auth_client`: bearer token verification against the auth service
//! - `rules_api`: HTTP surface for admins and the proxy

pub mod rules_types;
pub mod policy_store;
pub mod rules_persistence;
pub mod policy_model;
pub mod associations;
pub mod ip_policy;
pub mod attack_detector;
pub mod request_analyzer;
pub mod auth_client;
pub mod rules_api;

pub use rules_types::*;
pub use policy_store::*;
pub use rules_persistence::*;
pub use policy_model::*;
pub use associations::*;
pub use ip_policy::*;
pub use attack_detector::*;
pub use request_analyzer::*;
pub use auth_client::*;
pub use rules_api::*;
