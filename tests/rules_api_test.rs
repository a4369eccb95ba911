use aegis_rules_engine::rules::{
    run_rules_api, ActionType, AssociationManager, AttackDetector, AuthUser, AuthVerifier,
    InMemoryPolicyStore, PolicyError, PolicyService, RequestAnalyzer, RulesApi, ScanResult,
    REASON_SQLI,
};
use async_trait::async_trait;
use hyper::{Body, Client, Method, Request, StatusCode};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration};

struct TokenTable;

#[async_trait]
impl AuthVerifier for TokenTable {
    async fn verify_token(&self, token: &str) -> Result<AuthUser, PolicyError> {
        match token {
            "admin-token" => Ok(AuthUser {
                id: "admin-1".to_string(),
                username: "admin".to_string(),
            }),
            _ => Err(PolicyError::InvalidToken),
        }
    }
}

/// Start the API on a free local port
async fn start_rules_api() -> (SocketAddr, oneshot::Sender<()>) {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let store = Arc::new(InMemoryPolicyStore::new());
    let analyzer = RequestAnalyzer::new(store.clone(), Arc::new(AttackDetector::new().unwrap()));
    let api = Arc::new(RulesApi::new(
        PolicyService::new(store.clone()),
        AssociationManager::new(store),
        Arc::new(analyzer),
        Arc::new(TokenTable),
    ));

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(run_rules_api(addr, api, async {
        rx.await.ok();
    }));

    sleep(Duration::from_millis(100)).await;
    (addr, tx)
}

async fn call(addr: SocketAddr, method: Method, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", addr, path))
        .header("Content-Type", "application/json");
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    let req = builder.body(Body::from(body.to_string())).unwrap();

    let response = Client::new().request(req).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_admin_and_analyze_over_http() {
    let (addr, shutdown) = start_rules_api().await;
    let token = Some("admin-token");

    let (status, created) = call(
        addr,
        Method::POST,
        "/resources",
        token,
        json!({
            "name": "search",
            "http_method": "GET",
            "url": "/search",
            "host": "http://search.internal",
            "is_active": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["data"]["creator_id"], "admin-1");
    let resource_id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, rule) = call(
        addr,
        Method::POST,
        "/rules",
        token,
        json!({"name": "no sqli", "attack_type": "sqli", "action_type": "block", "is_active": true}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let rule_id = rule["data"]["id"].as_str().unwrap().to_string();

    let (status, link) = call(
        addr,
        Method::POST,
        &format!("/resources/{}/attach_rule", resource_id),
        token,
        json!({ "rule_id": rule_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(link["data"]["resource_id"], resource_id.as_str());

    let (status, joined) = call(addr, Method::GET, &format!("/resources/{}", resource_id), None, Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(joined["data"]["rules"][0]["id"], rule_id.as_str());
    assert_eq!(joined["data"]["ip_lists"], json!([]));

    let (status, verdict) = call(
        addr,
        Method::POST,
        "/analyze",
        None,
        json!({
            "ip": "203.0.113.4:40000",
            "method": "GET",
            "url": "/search?q=1%27%20OR%201=1%20--",
            "headers": {},
            "body": ""
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let verdict: ScanResult = serde_json::from_value(verdict).unwrap();
    assert_eq!(verdict.action, ActionType::Block);
    assert_eq!(verdict.reason, REASON_SQLI);

    let (status, _) = call(
        addr,
        Method::POST,
        &format!("/resources/{}/detach_rule", resource_id),
        token,
        json!({ "rule_id": rule_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, verdict) = call(
        addr,
        Method::POST,
        "/analyze",
        None,
        json!({"ip": "203.0.113.4", "method": "GET", "url": "/search?q=1%27%20OR%201=1%20--"}),
    )
    .await;
    assert_eq!(verdict["action"], "allow");

    shutdown.send(()).ok();
}

#[tokio::test]
async fn test_auth_and_link_errors_over_http() {
    let (addr, shutdown) = start_rules_api().await;

    let (status, body) = call(
        addr,
        Method::POST,
        "/rules",
        Some("stolen"),
        json!({"name": "x", "attack_type": "xss", "action_type": "block"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, body) = call(
        addr,
        Method::POST,
        "/resources/res_missing/attach_ip_list",
        Some("admin-token"),
        json!({"ip_list_id": "ipl_missing"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().starts_with("Resource not found"));

    let (status, body) = call(addr, Method::GET, "/rules", None, Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    shutdown.send(()).ok();
}
