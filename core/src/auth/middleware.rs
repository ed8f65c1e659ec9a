use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::Uri;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use kocao_common::response;

use crate::audit::{AuditEvent, AuditStore};
use crate::auth::token_store::{has_scope, Principal, TokenStore};

fn bearer_token(req: &Request<Body>) -> Option<String> {
    let header = req.headers().get(axum::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

/// Resolves whichever principal the bearer token maps to and attaches it to
/// the request's extensions. Never rejects on a missing or unknown token —
/// anonymous requests reach the handler and are turned away later by
/// `require_scopes` if the route demands a scope they don't have.
pub async fn authenticate(
    State(tokens): State<Arc<TokenStore>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(raw) = bearer_token(&req)
        && let Some(principal) = tokens.lookup(&raw)
    {
        req.extensions_mut().insert(principal);
    }
    next.run(req).await
}

pub fn last_path_segment(uri: &Uri) -> String {
    uri.path()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

pub fn fixed_resource_id(id: &'static str) -> impl Fn(&Uri) -> String + Clone + Send + Sync + 'static {
    move |_uri: &Uri| id.to_string()
}

/// Builds a middleware closure that denies requests lacking every scope in
/// `required`, auditing the decision either way: `denied(missing_token)` when
/// there's no principal at all, `denied(missing_scope)` when the principal is
/// short one or more scopes, otherwise `allowed` — emitted before the
/// downstream handler runs in both the deny and the allow case.
pub fn require_scopes<F>(
    audit: Arc<AuditStore>,
    required: &'static [&'static str],
    action: &'static str,
    resource_type: &'static str,
    resource_id_of: F,
) -> impl Fn(Request<Body>, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone
where
    F: Fn(&Uri) -> String + Clone + Send + Sync + 'static,
{
    move |req: Request<Body>, next: Next| {
        let audit = audit.clone();
        let resource_id_of = resource_id_of.clone();
        Box::pin(async move {
            let resource_id = resource_id_of(req.uri());
            let principal = req.extensions().get::<Principal>().cloned();

            let Some(principal) = principal else {
                audit.append(
                    AuditEvent::new("anonymous", action, resource_type, &resource_id, "denied")
                        .with_metadata(serde_json::json!({"reason": "missing_token"})),
                );
                return response::unauthorized(anyhow::anyhow!("missing bearer token"));
            };

            let missing: Vec<&str> = required
                .iter()
                .copied()
                .filter(|s| !has_scope(&principal.scopes, s))
                .collect();
            if !missing.is_empty() {
                audit.append(
                    AuditEvent::new(&principal.id, action, resource_type, &resource_id, "denied")
                        .with_metadata(serde_json::json!({
                            "reason": "missing_scope",
                            "required": missing,
                        })),
                );
                return response::forbidden(anyhow::anyhow!("missing required scope"));
            }

            audit.append(AuditEvent::new(
                &principal.id,
                action,
                resource_type,
                &resource_id,
                "allowed",
            ));
            next.run(req).await.into_response()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_path_segment_strips_trailing_slash() {
        let uri: Uri = "/v1/sessions/abc123/".parse().unwrap();
        assert_eq!(last_path_segment(&uri), "abc123");
    }

    #[test]
    fn last_path_segment_handles_root() {
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(last_path_segment(&uri), "");
    }

    #[test]
    fn fixed_resource_id_ignores_the_uri() {
        let f = fixed_resource_id("audit-log");
        let uri: Uri = "/v1/anything".parse().unwrap();
        assert_eq!(f(&uri), "audit-log");
    }
}
