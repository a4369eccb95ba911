//! Request Analyzer
//!
//! Combines the IP policy and the attack rules bound to a resource into one
//! verdict for the proxy.
//!
//! ```text
//! request ──► IP check ──block──► ScanResult(block)
//!                │
//!              allow
//!                ▼
//!           rule check ──block──► ScanResult(block)
//!                │
//!                ▼
//!     ScanResult(allow | sanitize | escape, rewritten url/body)
//! ```
//!
//! IP policy takes strict precedence: when it blocks, rules are never
//! loaded. Rules run in creation order against the running url/body, so
//! several sanitize/escape rules compose.

use std::sync::Arc;
use tracing::{debug, info};

use super::attack_detector::{AttackDetector, DetectionInput};
use super::ip_policy::IpPolicyEvaluator;
use super::policy_store::PolicyLookup;
use super::{ActionType, AnalysisPhase, AnalyzeRequest, PolicyError, Rule, ScanResult};

pub const REASON_PASSED: &str = "Request passed all checks.";

/// Path used to resolve the resource: trimmed, cut at the first `?` or `&`
pub fn extract_path(url: &str) -> &str {
    let url = url.trim();
    match url.find(|c: char| c == '?' || c == '&') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

fn phase_error(phase: AnalysisPhase, err: PolicyError) -> PolicyError {
    PolicyError::Analysis {
        phase,
        message: err.to_string(),
    }
}

pub struct RequestAnalyzer {
    lookup: Arc<dyn PolicyLookup>,
    detector: Arc<AttackDetector>,
    ip_policy: IpPolicyEvaluator,
}

impl RequestAnalyzer {
    pub fn new(lookup: Arc<dyn PolicyLookup>, detector: Arc<AttackDetector>) -> Self {
        Self {
            lookup,
            detector,
            ip_policy: IpPolicyEvaluator::new(),
        }
    }

    /// Analyze one inbound request
    pub async fn analyze(&self, request: &AnalyzeRequest) -> Result<ScanResult, PolicyError> {
        let path = extract_path(&request.url);
        debug!("Analyzing {} {} from {}", request.method, path, request.ip);

        let lists = self
            .lookup
            .ip_lists_by_url(path, &request.method)
            .await
            .map_err(|e| phase_error(AnalysisPhase::IpListLookup, e))?;

        let ip_result = self.ip_policy.evaluate(&request.ip, &lists);
        if ip_result.is_blocked() {
            info!(
                "Blocked {} {} from {}: {}",
                request.method, path, request.ip, ip_result.reason
            );
            return Ok(ip_result);
        }

        let rules = self
            .lookup
            .rules_by_url(path, &request.method)
            .await
            .map_err(|e| phase_error(AnalysisPhase::RuleLookup, e))?;

        let result = self.apply_rules(request, &rules);
        if result.is_blocked() {
            info!(
                "Blocked {} {} from {}: {}",
                request.method, path, request.ip, result.reason
            );
        } else {
            debug!("{} {} -> {}", request.method, path, result.action);
        }
        Ok(result)
    }

    /// Run the enabled rules in order against the running url/body pair
    pub fn apply_rules(&self, request: &AnalyzeRequest, rules: &[Rule]) -> ScanResult {
        let mut url = request.url.clone();
        let mut body = request.body.clone();
        let mut last_rewrite: Option<(ActionType, String)> = None;

        for rule in rules.iter().filter(|r| r.is_active.is_enabled()) {
            let input = DetectionInput {
                url: &url,
                body: &body,
                headers: &request.headers,
            };

            let verdict = match self.detector.detect(&rule.attack_type, &input, rule.action_type) {
                Some(verdict) => verdict,
                None => continue,
            };

            if verdict.action == ActionType::Block {
                debug!("Rule {} ({}) blocked the request", rule.id, rule.name);
                return verdict.into();
            }

            let mut rewrote = false;
            if let Some(modified) = verdict.modified_url {
                url = modified;
                rewrote = true;
            }
            if let Some(modified) = verdict.modified_body {
                body = modified;
                rewrote = true;
            }

            if rewrote && verdict.action.rewrites_payload() {
                debug!("Rule {} ({}) applied {}", rule.id, rule.name, verdict.action);
                last_rewrite = Some((verdict.action, verdict.reason));
            }
        }

        let modified_url = (url != request.url).then_some(url);
        let modified_body = (body != request.body).then_some(body);

        let (action, reason) = match last_rewrite {
            Some(rewrite) if modified_url.is_some() || modified_body.is_some() => rewrite,
            _ => (ActionType::Allow, REASON_PASSED.to_string()),
        };

        ScanResult {
            action,
            modified_url,
            modified_body,
            reason,
        }
    }
}
