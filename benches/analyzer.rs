//! Rules engine benchmarks
//!
//! Run with: cargo bench
//!
//! - Rule application: the per-request cost once policies are loaded
//! - Full analysis: store lookups plus rule application
//! - IP policy: list evaluation for a requester address

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::HashMap;
use std::sync::Arc;

use aegis_rules_engine::rules::{
    parse_cidr, ActionType, ActiveFlag, AnalyzeRequest, AssociationManager, AttackDetector,
    AttackType, InMemoryPolicyStore, IpList, IpPolicyEvaluator, PolicyService, RequestAnalyzer,
    ResourceInput, Rule, RuleInput,
};

fn rule(attack: &str, action: ActionType) -> Rule {
    Rule {
        id: format!("rule_{}_{}", attack, action),
        name: attack.to_string(),
        attack_type: AttackType::from(attack),
        action_type: action,
        is_active: ActiveFlag::Enabled,
        creator_id: "bench".to_string(),
        created_at: 0,
    }
}

fn request(url: &str, body: &str) -> AnalyzeRequest {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert("X-Csrf-Token".to_string(), "bench-token".to_string());
    AnalyzeRequest {
        ip: "10.0.0.5:41000".to_string(),
        method: "POST".to_string(),
        url: url.to_string(),
        headers,
        body: body.to_string(),
    }
}

// =============================================================================
// RULE APPLICATION
// =============================================================================

fn bench_apply_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("RuleApplication");
    let analyzer = RequestAnalyzer::new(
        Arc::new(InMemoryPolicyStore::new()),
        Arc::new(AttackDetector::new().unwrap()),
    );
    let rules = vec![
        rule("csrf", ActionType::Block),
        rule("xss", ActionType::Sanitize),
        rule("sqli", ActionType::Escape),
    ];

    group.throughput(Throughput::Elements(1));

    let payloads = [
        ("clean", request("/api/users?page=2", r#"{"name":"alice"}"#)),
        ("xss", request("/api/comments", "<script>alert(1)</script>hello")),
        ("sqli", request("/api/users?id=1%27%20OR%201=1%20--", "")),
    ];

    for (name, req) in payloads.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), req, |b, req| {
            b.iter(|| analyzer.apply_rules(black_box(req), black_box(&rules)))
        });
    }

    group.finish();
}

// =============================================================================
// FULL ANALYSIS
// =============================================================================

fn bench_analyze(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryPolicyStore::new());
    let policies = PolicyService::new(store.clone());
    let links = AssociationManager::new(store.clone());

    runtime.block_on(async {
        for i in 0..50 {
            let resource = policies
                .create_resource(ResourceInput {
                    name: format!("route-{}", i),
                    http_method: "POST".to_string(),
                    url: format!("/api/route/{}", i),
                    host: "http://backend".to_string(),
                    creator_id: "bench".to_string(),
                    is_active: ActiveFlag::Enabled,
                })
                .await
                .unwrap();

            for (attack, action) in [("xss", "sanitize"), ("sqli", "escape")] {
                let rule = policies
                    .create_rule(RuleInput {
                        name: format!("{}-{}", attack, i),
                        attack_type: attack.to_string(),
                        action_type: action.to_string(),
                        creator_id: "bench".to_string(),
                        is_active: ActiveFlag::Enabled,
                    })
                    .await
                    .unwrap();
                links.attach_rule(&resource.id, &rule.id).await.unwrap();
            }
        }
    });

    let analyzer = RequestAnalyzer::new(store, Arc::new(AttackDetector::new().unwrap()));
    let req = request("/api/route/25?q=<script>x</script>", "' OR 1=1 --");

    c.bench_function("analyze_with_store_lookup", |b| {
        b.to_async(&runtime)
            .iter(|| async { analyzer.analyze(black_box(&req)).await.unwrap() })
    });
}

// =============================================================================
// IP POLICY
// =============================================================================

fn bench_ip_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("IpPolicy");
    let evaluator = IpPolicyEvaluator::new();

    for count in [1usize, 10, 100] {
        let lists: Vec<IpList> = (0..count)
            .map(|i| IpList {
                id: format!("ipl_{}", i),
                ip: parse_cidr("10.0.0.0/8").unwrap(),
                list_type: "whitelist".to_string(),
                creator_id: "bench".to_string(),
                created_at: i as u64,
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("whitelists", count), &lists, |b, lists| {
            b.iter(|| evaluator.evaluate(black_box("10.1.2.3:5000"), black_box(lists)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_apply_rules, bench_analyze, bench_ip_policy);
criterion_main!(benches);
