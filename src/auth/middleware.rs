//! Request context extraction
//!
//! The surrounding gateway authenticates the caller and forwards the resolved
//! tenant in `X-Organization-ID` / `X-User-ID`. Handlers take a
//! [`RequestContext`] argument to require both.

use super::RequestContext;
use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};
use uuid::Uuid;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const USER_HEADER: &str = "x-user-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let organization_id = header_value(parts, ORGANIZATION_HEADER).ok_or((
            StatusCode::UNAUTHORIZED,
            "Missing organization context".to_string(),
        ))?;
        let user_id = header_value(parts, USER_HEADER).ok_or((
            StatusCode::UNAUTHORIZED,
            "Missing user context".to_string(),
        ))?;
        let request_id =
            header_value(parts, REQUEST_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(RequestContext {
            organization_id,
            user_id,
            request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(builder: axum::http::request::Builder) -> Result<RequestContext, StatusCode> {
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        RequestContext::from_request_parts(&mut parts, &())
            .await
            .map_err(|(status, _)| status)
    }

    #[tokio::test]
    async fn test_extracts_tenant_headers() {
        let ctx = extract(
            Request::builder()
                .header(ORGANIZATION_HEADER, "org-a")
                .header(USER_HEADER, "user-1")
                .header(REQUEST_ID_HEADER, "req-9"),
        )
        .await
        .unwrap();

        assert_eq!(ctx.organization_id, "org-a");
        assert_eq!(ctx.user_id, "user-1");
        assert_eq!(ctx.request_id, "req-9");
    }

    #[tokio::test]
    async fn test_missing_organization_rejected() {
        let status = extract(Request::builder().header(USER_HEADER, "user-1"))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_blank_user_rejected() {
        let status = extract(
            Request::builder()
                .header(ORGANIZATION_HEADER, "org-a")
                .header(USER_HEADER, "  "),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
