use std::collections::BTreeMap;

use axum::extract::ws::WebSocket;
use axum::extract::{Extension, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use kube::api::{ListParams, Patch, PatchParams};
use serde::Deserialize;
use serde_json::json;

use kocao_common::{labels, response};
use kocao_core::attach::{normalize_attach_role, AttachRole};
use kocao_core::audit::AuditEvent;
use kocao_core::auth::{authenticate, fixed_resource_id, has_scope, last_path_segment, require_scopes, Principal};
use kocao_types::{AgentAuthSpec, EnvVar, GitAuthSpec, HarnessRun, HarnessRunSpec, WorkspaceSession, WorkspaceSessionSpec};

use crate::app::App;

const ATTACH_COOKIE_NAME: &str = "kocao_attach_token";

pub fn router(app: App) -> Router {
    let audit = app.audit.clone();
    let tokens = app.tokens.clone();

    let api = Router::new()
        .route(
            "/v1/sessions",
            post(create_session).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["workspace-session:write"],
                "workspace-session.create",
                "workspace-session",
                fixed_resource_id("new"),
            ))),
        )
        .route(
            "/v1/sessions",
            get(list_sessions).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["workspace-session:read"],
                "workspace-session.list",
                "workspace-session",
                fixed_resource_id("list"),
            ))),
        )
        .route(
            "/v1/sessions/{name}",
            get(get_session).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["workspace-session:read"],
                "workspace-session.get",
                "workspace-session",
                last_path_segment,
            ))),
        )
        .route(
            "/v1/sessions/{name}",
            axum::routing::delete(delete_session).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["workspace-session:write"],
                "workspace-session.delete",
                "workspace-session",
                last_path_segment,
            ))),
        )
        .route(
            "/v1/sessions/{name}/attach-control",
            patch(attach_control).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["control:write"],
                "attach-control.update",
                "workspace-session",
                action_path_resource_id,
            ))),
        )
        .route(
            "/v1/sessions/{name}/egress-override",
            patch(egress_override).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["control:write"],
                "egress-override.update",
                "workspace-session",
                action_path_resource_id,
            ))),
        )
        .route(
            "/v1/sessions/{name}/attach-token",
            post(attach_token).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["harness-run:read"],
                "attach-token.issue",
                "workspace-session",
                action_path_resource_id,
            ))),
        )
        .route(
            "/v1/sessions/{name}/attach-cookie",
            post(attach_cookie).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["harness-run:read"],
                "attach-cookie.issue",
                "workspace-session",
                action_path_resource_id,
            ))),
        )
        .route("/v1/sessions/{name}/attach", get(attach_ws))
        .route(
            "/v1/runs",
            post(create_run).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["harness-run:write"],
                "harness-run.start",
                "harness-run",
                fixed_resource_id("new"),
            ))),
        )
        .route(
            "/v1/runs",
            get(list_runs).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["harness-run:read"],
                "harness-run.list",
                "harness-run",
                fixed_resource_id("list"),
            ))),
        )
        .route(
            "/v1/runs/{name}",
            get(get_run).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["harness-run:read"],
                "harness-run.get",
                "harness-run",
                last_path_segment,
            ))),
        )
        .route(
            "/v1/runs/{name}/resume",
            post(resume_run).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["harness-run:write"],
                "harness-run.resume",
                "harness-run",
                action_path_resource_id,
            ))),
        )
        .route(
            "/v1/runs/{name}/stop",
            post(stop_run).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["harness-run:write"],
                "harness-run.stop",
                "harness-run",
                action_path_resource_id,
            ))),
        )
        .route(
            "/v1/audit",
            get(list_audit).route_layer(middleware::from_fn(require_scopes(
                audit.clone(),
                &["audit:read"],
                "audit.list",
                "audit",
                fixed_resource_id("log"),
            ))),
        )
        .layer(middleware::from_fn_with_state(tokens, authenticate));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/openapi.json", get(openapi))
        .merge(api)
        .with_state(app)
}

/// Resource id for routes shaped `/v1/.../{name}/<action>` — the second-to-last
/// path segment, regardless of whether the resource is a session or a run.
fn action_path_resource_id(uri: &Uri) -> String {
    let trimmed = uri.path().trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    segments
        .len()
        .checked_sub(2)
        .and_then(|i| segments.get(i))
        .copied()
        .unwrap_or("")
        .to_string()
}

fn is_valid_egress_mode(mode: &str) -> bool {
    matches!(
        mode.trim().to_lowercase().as_str(),
        "" | "restricted" | "deny-by-default" | "github" | "github-only" | "full" | "full-internet" | "internet"
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn openapi() -> Json<serde_json::Value> {
    let session_schema = schemars::schema_for!(WorkspaceSessionSpec);
    let run_schema = schemars::schema_for!(HarnessRunSpec);
    Json(json!({
        "openapi": "3.0.3",
        "info": { "title": "kocao control plane", "version": env!("CARGO_PKG_VERSION") },
        "paths": {
            "/v1/sessions": {
                "post": { "summary": "create a workspace session" },
                "get": { "summary": "list workspace sessions" },
            },
            "/v1/sessions/{name}": {
                "get": { "summary": "get a workspace session" },
                "delete": { "summary": "delete a workspace session" },
            },
            "/v1/sessions/{name}/attach-control": { "patch": { "summary": "enable or disable attach for a session" } },
            "/v1/sessions/{name}/egress-override": { "patch": { "summary": "override a session's egress mode" } },
            "/v1/sessions/{name}/attach-token": { "post": { "summary": "issue an attach token" } },
            "/v1/sessions/{name}/attach-cookie": { "post": { "summary": "issue an attach token as an HttpOnly cookie" } },
            "/v1/sessions/{name}/attach": { "get": { "summary": "attach to a session over a websocket" } },
            "/v1/runs": {
                "post": { "summary": "start a harness run" },
                "get": { "summary": "list harness runs, optionally filtered by ?workspaceSessionID=" },
            },
            "/v1/runs/{name}": { "get": { "summary": "get a harness run" } },
            "/v1/runs/{name}/resume": { "post": { "summary": "resume a finished harness run" } },
            "/v1/runs/{name}/stop": { "post": { "summary": "stop a harness run" } },
            "/v1/audit": { "get": { "summary": "list audit events" } },
        },
        "components": {
            "schemas": {
                "WorkspaceSessionSpec": session_schema,
                "HarnessRunSpec": run_schema,
            },
        },
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    storage_class_name: Option<String>,
    #[serde(default)]
    storage_size: Option<String>,
    #[serde(default)]
    egress_mode: Option<String>,
}

async fn create_session(State(app): State<App>, Json(req): Json<CreateSessionRequest>) -> Response {
    let egress_mode = req.egress_mode.unwrap_or_default();
    if !is_valid_egress_mode(&egress_mode) {
        return response::bad_request(anyhow::anyhow!("invalid egressMode"));
    }

    let api: kube::Api<WorkspaceSession> = kube::Api::namespaced(app.client.clone(), &app.namespace);

    if let Some(display_name) = req.display_name.as_deref().filter(|d| !d.is_empty()) {
        match api.list(&ListParams::default()).await {
            Ok(existing) if existing.items.iter().any(|s| s.spec.display_name.as_deref() == Some(display_name)) => {
                return response::conflict(anyhow::anyhow!("workspace session with displayName '{display_name}' already exists"));
            }
            Ok(_) => {}
            Err(e) => return response::bad_gateway(e),
        }
    }

    let name = kocao_core::namegen::generate();
    let session = WorkspaceSession::new(
        &name,
        WorkspaceSessionSpec {
            display_name: req.display_name,
            storage_class_name: req.storage_class_name,
            storage_size: req.storage_size.unwrap_or_else(|| "10Gi".to_string()),
            egress_mode,
            attach_enabled: false,
        },
    );
    match api.create(&Default::default(), &session).await {
        Ok(created) => {
            app.audit.append(AuditEvent::new(
                "system",
                "workspace-session.create",
                "workspace-session",
                &name,
                "allowed",
            ));
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            response::conflict(anyhow::anyhow!("workspace session {name} already exists"))
        }
        Err(e) => response::bad_gateway(e),
    }
}

async fn list_sessions(State(app): State<App>) -> Response {
    let api: kube::Api<WorkspaceSession> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    match api.list(&ListParams::default()).await {
        Ok(sessions) => Json(sessions.items).into_response(),
        Err(e) => response::bad_gateway(e),
    }
}

async fn get_session(State(app): State<App>, Path(name): Path<String>) -> Response {
    let api: kube::Api<WorkspaceSession> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    match api.get_opt(&name).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => response::not_found(anyhow::anyhow!("workspace session {name} not found")),
        Err(e) => response::bad_gateway(e),
    }
}

async fn delete_session(State(app): State<App>, Path(name): Path<String>) -> Response {
    let api: kube::Api<WorkspaceSession> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    match api.delete(&name, &Default::default()).await {
        Ok(_) => {
            app.audit.append(AuditEvent::new(
                "system",
                "workspace-session.delete",
                "workspace-session",
                &name,
                "allowed",
            ));
            StatusCode::OK.into_response()
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => StatusCode::OK.into_response(),
        Err(e) => response::bad_gateway(e),
    }
}

#[derive(Deserialize)]
struct AttachControlRequest {
    enabled: bool,
}

async fn attach_control(
    State(app): State<App>,
    Path(name): Path<String>,
    Json(req): Json<AttachControlRequest>,
) -> Response {
    let api: kube::Api<WorkspaceSession> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    let patch = Patch::Merge(json!({ "spec": { "attach_enabled": req.enabled } }));
    match api.patch(&name, &PatchParams::default(), &patch).await {
        Ok(updated) => {
            app.audit.append(AuditEvent::new(
                "system",
                "attach-control.update",
                "workspace-session",
                &name,
                "allowed",
            ));
            Json(updated).into_response()
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            response::not_found(anyhow::anyhow!("workspace session {name} not found"))
        }
        Err(e) => response::bad_gateway(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EgressOverrideRequest {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    allowed_hosts: Option<serde_json::Value>,
}

async fn egress_override(
    State(app): State<App>,
    Path(name): Path<String>,
    Json(req): Json<EgressOverrideRequest>,
) -> Response {
    if req.allowed_hosts.is_some() {
        return response::bad_request(anyhow::anyhow!(
            "allowedHosts is not supported: host-based egress allowlisting is not enforced"
        ));
    }
    let Some(mode) = req.mode.as_deref() else {
        return response::bad_request(anyhow::anyhow!("mode required"));
    };
    if !is_valid_egress_mode(mode) {
        return response::bad_request(anyhow::anyhow!("invalid egressMode"));
    }

    let api: kube::Api<WorkspaceSession> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    let patch = Patch::Merge(json!({ "spec": { "egress_mode": mode } }));
    match api.patch(&name, &PatchParams::default(), &patch).await {
        Ok(updated) => {
            app.audit.append(AuditEvent::new(
                "system",
                "egress-override.update",
                "workspace-session",
                &name,
                "allowed",
            ));
            Json(updated).into_response()
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            response::not_found(anyhow::anyhow!("workspace session {name} not found"))
        }
        Err(e) => response::bad_gateway(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunRequest {
    #[serde(default)]
    workspace_session_name: Option<String>,
    #[serde(default)]
    repo_url: String,
    #[serde(default)]
    repo_revision: Option<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: Vec<EnvVar>,
    #[serde(default)]
    git_auth: Option<GitAuthSpec>,
    #[serde(default)]
    agent_auth: Option<AgentAuthSpec>,
    #[serde(default)]
    egress_mode: Option<String>,
    #[serde(default)]
    ttl_seconds_after_finished: Option<u32>,
    #[serde(default)]
    allowed_hosts: Option<serde_json::Value>,
}

fn validate_create_run(req: &CreateRunRequest) -> Option<&'static str> {
    if req.allowed_hosts.is_some() {
        return Some("allowedHosts is not supported: host-based egress allowlisting is not enforced");
    }
    if req.repo_url.is_empty() {
        return Some("repoURL required");
    }
    if !req.repo_url.starts_with("https://") {
        return Some("repoURL must be an https:// URL");
    }
    if req.image.is_empty() {
        return Some("image required");
    }
    if req.command.len() > 64 {
        return Some("command list too long (max 64)");
    }
    if req.args.len() > 128 {
        return Some("args list too long (max 128)");
    }
    if req.env.len() > 64 {
        return Some("env list too long (max 64)");
    }
    if req.ttl_seconds_after_finished.is_some_and(|ttl| ttl > 86400) {
        return Some("ttlSecondsAfterFinished must be 0-86400");
    }
    if let Some(mode) = &req.egress_mode
        && !is_valid_egress_mode(mode)
    {
        return Some("invalid egressMode");
    }
    None
}

/// Heuristic `credential.use` audit annotation: flags `env` entries whose
/// name looks like a secret, plus whether a git credential secret is wired in.
fn credential_use_metadata(spec: &HarnessRunSpec) -> serde_json::Value {
    let flagged_env: Vec<&str> = spec
        .env
        .iter()
        .filter(|e| {
            let upper = e.name.to_uppercase();
            upper.contains("TOKEN") || upper.contains("SECRET") || upper.ends_with("_KEY")
        })
        .map(|e| e.name.as_str())
        .collect();
    json!({
        "credential.use": {
            "env": flagged_env,
            "gitAuth": spec.git_auth.is_some(),
        },
    })
}

async fn create_run(State(app): State<App>, Json(req): Json<CreateRunRequest>) -> Response {
    if let Some(reason) = validate_create_run(&req) {
        return response::bad_request(anyhow::anyhow!(reason));
    }
    let name = kocao_core::namegen::generate();
    let spec = HarnessRunSpec {
        workspace_session_name: req.workspace_session_name.clone(),
        repo_url: req.repo_url,
        repo_revision: req.repo_revision,
        image: req.image,
        command: req.command,
        args: req.args,
        working_dir: req.working_dir,
        env: req.env,
        git_auth: req.git_auth,
        agent_auth: req.agent_auth,
        egress_mode: req.egress_mode.unwrap_or_else(|| "restricted".to_string()),
        ttl_seconds_after_finished: req.ttl_seconds_after_finished.unwrap_or(300),
    };
    let audit_metadata = credential_use_metadata(&spec);
    let mut run = HarnessRun::new(&name, spec);
    if let Some(session_name) = req.workspace_session_name.as_ref().filter(|s| !s.is_empty()) {
        run.metadata.labels = Some(BTreeMap::from([(labels::SESSION_NAME.to_string(), session_name.clone())]));
    }

    let api: kube::Api<HarnessRun> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    match api.create(&Default::default(), &run).await {
        Ok(created) => {
            app.audit.append(
                AuditEvent::new("system", "harness-run.start", "harness-run", &name, "allowed")
                    .with_metadata(audit_metadata),
            );
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            response::conflict(anyhow::anyhow!("harness run {name} already exists"))
        }
        Err(e) => response::bad_gateway(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRunsQuery {
    workspace_session_id: Option<String>,
}

async fn list_runs(State(app): State<App>, Query(query): Query<ListRunsQuery>) -> Response {
    let api: kube::Api<HarnessRun> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    let lp = match query.workspace_session_id.as_deref().filter(|s| !s.is_empty()) {
        Some(session_id) => ListParams::default().labels(&format!("{}={session_id}", labels::SESSION_NAME)),
        None => ListParams::default(),
    };
    match api.list(&lp).await {
        Ok(runs) => Json(runs.items).into_response(),
        Err(e) => response::bad_gateway(e),
    }
}

async fn get_run(State(app): State<App>, Path(name): Path<String>) -> Response {
    let api: kube::Api<HarnessRun> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    match api.get_opt(&name).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => response::not_found(anyhow::anyhow!("harness run {name} not found")),
        Err(e) => response::bad_gateway(e),
    }
}

async fn resume_run(State(app): State<App>, Path(name): Path<String>) -> Response {
    let api: kube::Api<HarnessRun> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    let old = match api.get_opt(&name).await {
        Ok(Some(run)) => run,
        Ok(None) => return response::not_found(anyhow::anyhow!("harness run {name} not found")),
        Err(e) => return response::bad_gateway(e),
    };
    let new_name = kocao_core::namegen::generate();
    let mut run = HarnessRun::new(&new_name, old.spec.clone());
    let mut run_labels = BTreeMap::from([(labels::RESUMED_FROM.to_string(), name.clone())]);
    if let Some(session_name) = old.spec.workspace_session_name.as_ref().filter(|s| !s.is_empty()) {
        run_labels.insert(labels::SESSION_NAME.to_string(), session_name.clone());
    }
    run.metadata.labels = Some(run_labels);
    match api.create(&Default::default(), &run).await {
        Ok(created) => {
            app.audit.append(
                AuditEvent::new("system", "harness-run.resume", "harness-run", &new_name, "allowed")
                    .with_metadata(json!({ "resumedFrom": name })),
            );
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(e) => response::bad_gateway(e),
    }
}

async fn stop_run(State(app): State<App>, Path(name): Path<String>) -> Response {
    let api: kube::Api<HarnessRun> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    match api.delete(&name, &Default::default()).await {
        Ok(_) => {
            app.audit.append(AuditEvent::new("system", "harness-run.stop", "harness-run", &name, "allowed"));
            StatusCode::OK.into_response()
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => StatusCode::OK.into_response(),
        Err(e) => response::bad_gateway(e),
    }
}

#[derive(Deserialize)]
struct AttachTokenRequest {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

async fn attach_enabled_for(app: &App, name: &str) -> Result<bool, Response> {
    let api: kube::Api<WorkspaceSession> = kube::Api::namespaced(app.client.clone(), &app.namespace);
    match api.get_opt(name).await {
        Ok(Some(session)) => Ok(session.spec.attach_enabled),
        Ok(None) => Err(response::not_found(anyhow::anyhow!("workspace session {name} not found"))),
        Err(e) => Err(response::bad_gateway(e)),
    }
}

async fn attach_token(
    State(app): State<App>,
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AttachTokenRequest>,
) -> Response {
    let Some(raw_mode) = req.mode.as_deref() else {
        return response::bad_request(anyhow::anyhow!("mode required"));
    };
    let Some(role) = normalize_attach_role(raw_mode) else {
        return response::bad_request(anyhow::anyhow!("invalid mode"));
    };
    match attach_enabled_for(&app, &name).await {
        Ok(true) => {}
        Ok(false) => return response::forbidden(anyhow::anyhow!("attach is disabled for this session")),
        Err(e) => return e,
    }
    if role == AttachRole::Driver && !has_scope(&principal.scopes, "control:write") {
        app.audit.append(
            AuditEvent::new(&principal.id, "attach-token.issue", "workspace-session", &name, "denied")
                .with_metadata(json!({"reason": "missing_scope", "required": "control:write"})),
        );
        return response::forbidden(anyhow::anyhow!("missing required scope"));
    }
    let (token, expires_at, client_id) = app.attach.issue_token(&principal.id, &name, role, req.client_id);
    app.audit.append(AuditEvent::new(
        &principal.id,
        "attach-token.issue",
        "workspace-session",
        &name,
        "allowed",
    ));
    Json(json!({
        "token": token,
        "expiresAt": expires_at,
        "clientID": client_id,
    }))
    .into_response()
}

async fn attach_cookie(
    State(app): State<App>,
    Path(name): Path<String>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AttachTokenRequest>,
) -> Response {
    let Some(raw_mode) = req.mode.as_deref() else {
        return response::bad_request(anyhow::anyhow!("mode required"));
    };
    let Some(role) = normalize_attach_role(raw_mode) else {
        return response::bad_request(anyhow::anyhow!("invalid mode"));
    };
    match attach_enabled_for(&app, &name).await {
        Ok(true) => {}
        Ok(false) => return response::forbidden(anyhow::anyhow!("attach is disabled for this session")),
        Err(e) => return e,
    }
    if role == AttachRole::Driver && !has_scope(&principal.scopes, "control:write") {
        app.audit.append(
            AuditEvent::new(&principal.id, "attach-cookie.issue", "workspace-session", &name, "denied")
                .with_metadata(json!({"reason": "missing_scope", "required": "control:write"})),
        );
        return response::forbidden(anyhow::anyhow!("missing required scope"));
    }
    let (token, expires_at, client_id) = app.attach.issue_token(&principal.id, &name, role, req.client_id);
    app.audit.append(AuditEvent::new(
        &principal.id,
        "attach-cookie.issue",
        "workspace-session",
        &name,
        "allowed",
    ));
    let mut response = Json(json!({
        "expiresAt": expires_at,
        "clientID": client_id,
    }))
    .into_response();
    let cookie = format!("{ATTACH_COOKIE_NAME}={token}; Path=/v1/sessions/{name}/attach; HttpOnly; SameSite=Strict; Secure");
    if let Ok(value) = header::HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == ATTACH_COOKIE_NAME).then(|| value.to_string())
    })
}

#[derive(Deserialize)]
struct AttachQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn attach_ws(
    State(app): State<App>,
    Path(name): Path<String>,
    Query(query): Query<AttachQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| cookie_token(&headers))
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(|s| s.trim().to_string())
        });
    let Some(token) = token else {
        return response::unauthorized(anyhow::anyhow!("missing attach token"));
    };
    let (session_id, client_id, role) = match app.attach.claims_from_token(&token) {
        Ok(claims) => claims,
        Err(e) => return response::unauthorized(e),
    };
    if session_id != name {
        return response::unauthorized(anyhow::anyhow!("attach token does not match this session"));
    }
    let attach = app.attach.clone();
    ws.on_upgrade(move |socket: WebSocket| async move {
        attach.handle_connection(session_id, client_id, role, socket).await;
    })
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<String>,
}

async fn list_audit(State(app): State<App>, Query(query): Query<AuditQuery>) -> Response {
    let limit = match query.limit.as_deref() {
        None => None,
        Some(s) if s.trim().is_empty() => None,
        Some(s) => match s.parse::<usize>() {
            Ok(n) => Some(n),
            Err(_) => return response::bad_request(anyhow::anyhow!("invalid limit")),
        },
    };
    Json(app.audit.list(limit)).into_response()
}
