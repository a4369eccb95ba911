//! Rules Engine HTTP API
//!
//! Admin CRUD for resources, rules and IP lists plus the `/analyze` endpoint
//! the proxy calls for every inbound request.
//!
//! - `GET  /health`
//! - `GET  /resources`, `GET /resources/{id}`
//! - `POST /resources`, `PUT /resources/{id}`                      (auth)
//! - `POST /resources/{id}/attach_ip_list|detach_ip_list`          (auth)
//! - `POST /resources/{id}/attach_rule|detach_rule`                (auth)
//! - `GET  /ip_lists`, `POST /ip_lists`, `PUT /ip_lists/{id}`      (auth on writes)
//! - `GET  /rules`, `POST /rules`, `PUT /rules/{id}`               (auth on writes)
//! - `GET|POST /analyze` → bare `ScanResult`
//!
//! Admin responses use the `{success, data?, error?}` envelope.

use anyhow::Result;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::associations::{AssociationManager, IpListLinkRequest, RuleLinkRequest};
use super::auth_client::{bearer_token, AuthUser, AuthVerifier};
use super::policy_model::{IpListInput, PolicyService, ResourceInput, RuleInput};
use super::request_analyzer::RequestAnalyzer;
use super::{AnalyzeRequest, PolicyError};

/// Maximum allowed request body size (64KB)
pub const MAX_REQUEST_BODY_SIZE: usize = 64 * 1024;

/// Deadline for a single `/analyze` call
pub const DEFAULT_ANALYZE_TIMEOUT: Duration = Duration::from_secs(3);

/// Read request body with size limit
async fn read_body_limited(body: Body, limit: usize) -> Result<Vec<u8>, (StatusCode, String)> {
    use futures::StreamExt;

    let mut total_size = 0usize;
    let mut result = Vec::new();

    let mut stream = body;
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Error reading body: {}", e)))?;
        total_size += chunk.len();
        if total_size > limit {
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Request body size exceeds maximum allowed {} bytes", limit),
            ));
        }
        result.extend_from_slice(&chunk);
    }

    Ok(result)
}

// =============================================================================
// API RESPONSE
// =============================================================================

/// Standard API response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// HTTP status for a rules engine error
pub fn status_for(err: &PolicyError) -> StatusCode {
    match err {
        PolicyError::ValidationFailed(_) | PolicyError::InvalidCidr(_) => StatusCode::BAD_REQUEST,
        PolicyError::NotFound { .. } => StatusCode::NOT_FOUND,
        PolicyError::Unauthorized(_) | PolicyError::InvalidToken => StatusCode::UNAUTHORIZED,
        PolicyError::Store(_) | PolicyError::Analysis { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        PolicyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Body::from(serde_json::to_string(body)?))?)
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let response = ApiResponse::<()>::error(message);
    let mut resp = Response::new(Body::from(
        serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string()),
    ));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp.headers_mut()
        .insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    resp
}

fn policy_error_response(err: &PolicyError) -> Response<Body> {
    let status = status_for(err);
    if status.is_server_error() {
        error!("Rules API error: {}", err);
    } else {
        debug!("Rules API rejected request: {}", err);
    }
    error_response(status, &err.to_string())
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, PolicyError>) -> Result<Response<Body>> {
    match result {
        Ok(data) => json_response(status, &ApiResponse::success(data)),
        Err(e) => Ok(policy_error_response(&e)),
    }
}

// =============================================================================
// API HANDLER
// =============================================================================

/// Rules engine API handler
pub struct RulesApi {
    policies: PolicyService,
    links: AssociationManager,
    analyzer: Arc<RequestAnalyzer>,
    auth: Arc<dyn AuthVerifier>,
    max_body_bytes: usize,
    analyze_timeout: Duration,
}

impl RulesApi {
    pub fn new(
        policies: PolicyService,
        links: AssociationManager,
        analyzer: Arc<RequestAnalyzer>,
        auth: Arc<dyn AuthVerifier>,
    ) -> Self {
        Self {
            policies,
            links,
            analyzer,
            auth,
            max_body_bytes: MAX_REQUEST_BODY_SIZE,
            analyze_timeout: DEFAULT_ANALYZE_TIMEOUT,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_analyze_timeout(mut self, timeout: Duration) -> Self {
        self.analyze_timeout = timeout;
        self
    }

    /// Handle HTTP requests
    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!("Rules API request: {} {}", method, path);

        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (method, segments.as_slice()) {
            (Method::OPTIONS, _) => Ok(Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header("Access-Control-Allow-Origin", "*")
                .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
                .header("Access-Control-Allow-Headers", "Content-Type, Authorization")
                .body(Body::empty())?),

            (Method::GET, ["health"]) => self.handle_health(),

            // Resources
            (Method::GET, ["resources"]) => respond(StatusCode::OK, self.policies.list_resources().await),
            (Method::POST, ["resources"]) => self.handle_create_resource(req).await,
            (Method::GET, ["resources", id]) => respond(
                StatusCode::OK,
                self.policies.get_resource_with_policies(id).await,
            ),
            (Method::PUT, ["resources", id]) => {
                let id = id.to_string();
                self.handle_update_resource(&id, req).await
            }
            (Method::POST, ["resources", id, action]) => {
                let (id, action) = (id.to_string(), action.to_string());
                self.handle_link(&id, &action, req).await
            }

            // IP lists
            (Method::GET, ["ip_lists"]) => respond(StatusCode::OK, self.policies.list_ip_lists().await),
            (Method::POST, ["ip_lists"]) => self.handle_create_ip_list(req).await,
            (Method::PUT, ["ip_lists", id]) => {
                let id = id.to_string();
                self.handle_update_ip_list(&id, req).await
            }

            // Rules
            (Method::GET, ["rules"]) => respond(StatusCode::OK, self.policies.list_rules().await),
            (Method::POST, ["rules"]) => self.handle_create_rule(req).await,
            (Method::PUT, ["rules", id]) => {
                let id = id.to_string();
                self.handle_update_rule(&id, req).await
            }

            // Analysis
            (Method::GET, ["analyze"]) | (Method::POST, ["analyze"]) => {
                self.handle_analyze(req).await
            }

            _ => Ok(error_response(StatusCode::NOT_FOUND, "Endpoint not found")),
        }
    }

    fn handle_health(&self) -> Result<Response<Body>> {
        json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
    }

    // =========================================================================
    // REQUEST PLUMBING
    // =========================================================================

    async fn authenticate(&self, req: &Request<Body>) -> Result<AuthUser, PolicyError> {
        let header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let token = bearer_token(header)?;
        self.auth.verify_token(token).await
    }

    async fn read_json<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Response<Body>> {
        let bytes = read_body_limited(req.into_body(), self.max_body_bytes)
            .await
            .map_err(|(status, message)| error_response(status, &message))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {}", e)))
    }

    /// Authenticate, then parse the body. Nothing is parsed for an
    /// unauthenticated caller.
    async fn authenticated_json<T: DeserializeOwned>(
        &self,
        req: Request<Body>,
    ) -> Result<(AuthUser, T), Response<Body>> {
        let user = self
            .authenticate(&req)
            .await
            .map_err(|e| policy_error_response(&e))?;
        let body = self.read_json(req).await?;
        Ok((user, body))
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    async fn handle_create_resource(&self, req: Request<Body>) -> Result<Response<Body>> {
        let (user, mut input) = match self.authenticated_json::<ResourceInput>(req).await {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        };
        if !user.id.is_empty() {
            input.creator_id = user.id;
        }

        respond(StatusCode::CREATED, self.policies.create_resource(input).await)
    }

    async fn handle_update_resource(&self, id: &str, req: Request<Body>) -> Result<Response<Body>> {
        let (_, update) = match self.authenticated_json::<ResourceInput>(req).await {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        };

        respond(StatusCode::OK, self.policies.update_resource(id, update).await)
    }

    async fn handle_link(&self, resource_id: &str, action: &str, req: Request<Body>) -> Result<Response<Body>> {
        match action {
            "attach_ip_list" | "detach_ip_list" => {
                let (_, link) = match self.authenticated_json::<IpListLinkRequest>(req).await {
                    Ok(parsed) => parsed,
                    Err(response) => return Ok(response),
                };
                if action == "attach_ip_list" {
                    respond(
                        StatusCode::OK,
                        self.links.attach_ip_list(resource_id, &link.ip_list_id).await,
                    )
                } else {
                    respond(
                        StatusCode::OK,
                        self.links
                            .detach_ip_list(resource_id, &link.ip_list_id)
                            .await
                            .map(|_| Detached {
                                resource_id: resource_id.to_string(),
                                target_id: link.ip_list_id,
                            }),
                    )
                }
            }
            "attach_rule" | "detach_rule" => {
                let (_, link) = match self.authenticated_json::<RuleLinkRequest>(req).await {
                    Ok(parsed) => parsed,
                    Err(response) => return Ok(response),
                };
                if action == "attach_rule" {
                    respond(
                        StatusCode::OK,
                        self.links.attach_rule(resource_id, &link.rule_id).await,
                    )
                } else {
                    respond(
                        StatusCode::OK,
                        self.links
                            .detach_rule(resource_id, &link.rule_id)
                            .await
                            .map(|_| Detached {
                                resource_id: resource_id.to_string(),
                                target_id: link.rule_id,
                            }),
                    )
                }
            }
            _ => Ok(error_response(StatusCode::NOT_FOUND, "Endpoint not found")),
        }
    }

    // =========================================================================
    // IP LISTS
    // =========================================================================

    async fn handle_create_ip_list(&self, req: Request<Body>) -> Result<Response<Body>> {
        let (user, mut input) = match self.authenticated_json::<IpListInput>(req).await {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        };
        if !user.id.is_empty() {
            input.creator_id = user.id;
        }

        respond(StatusCode::CREATED, self.policies.create_ip_list(input).await)
    }

    async fn handle_update_ip_list(&self, id: &str, req: Request<Body>) -> Result<Response<Body>> {
        let (_, update) = match self.authenticated_json::<IpListInput>(req).await {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        };

        respond(StatusCode::OK, self.policies.update_ip_list(id, update).await)
    }

    // =========================================================================
    // RULES
    // =========================================================================

    async fn handle_create_rule(&self, req: Request<Body>) -> Result<Response<Body>> {
        let (user, mut input) = match self.authenticated_json::<RuleInput>(req).await {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        };
        if !user.id.is_empty() {
            input.creator_id = user.id;
        }

        respond(StatusCode::CREATED, self.policies.create_rule(input).await)
    }

    async fn handle_update_rule(&self, id: &str, req: Request<Body>) -> Result<Response<Body>> {
        let (_, update) = match self.authenticated_json::<RuleInput>(req).await {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        };

        respond(StatusCode::OK, self.policies.update_rule(id, update).await)
    }

    // =========================================================================
    // ANALYSIS
    // =========================================================================

    async fn handle_analyze(&self, req: Request<Body>) -> Result<Response<Body>> {
        let request: AnalyzeRequest = match self.read_json(req).await {
            Ok(parsed) => parsed,
            Err(response) => return Ok(response),
        };

        match tokio::time::timeout(self.analyze_timeout, self.analyzer.analyze(&request)).await {
            Ok(Ok(result)) => json_response(StatusCode::OK, &result),
            Ok(Err(e)) => Ok(policy_error_response(&e)),
            Err(_) => {
                warn!(
                    "Analysis of {} {} timed out after {:?}",
                    request.method, request.url, self.analyze_timeout
                );
                let err = PolicyError::Timeout(format!(
                    "analysis exceeded {} ms",
                    self.analyze_timeout.as_millis()
                ));
                Ok(policy_error_response(&err))
            }
        }
    }
}

/// Response body of a detach call
#[derive(Debug, Serialize)]
struct Detached {
    resource_id: String,
    target_id: String,
}

// =============================================================================
// SERVER
// =============================================================================

/// Serve the API until `shutdown` resolves
pub async fn run_rules_api<F>(addr: SocketAddr, api: Arc<RulesApi>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting rules engine API on {}", addr);

    let make_svc = make_service_fn(move |_conn| {
        let api = api.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let api = api.clone();
                async move {
                    match api.handle_request(req).await {
                        Ok(response) => Ok::<_, Infallible>(response),
                        Err(e) => {
                            error!("Rules API error: {}", e);
                            Ok(error_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "Internal server error",
                            ))
                        }
                    }
                }
            }))
        }
    });

    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Rules engine API stopped");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
