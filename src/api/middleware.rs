// Request extractors shared by the REST handlers

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const DEFAULT_TENANT: &str = "default";

/// Tenant owning the request: `x-tenant-id` header, then `tenant_id` query parameter, then `default`
#[derive(Debug, Clone, PartialEq)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(value) = parts.headers.get(TENANT_HEADER) {
            let tenant = value
                .to_str()
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid x-tenant-id header"))?
                .trim();
            if !tenant.is_empty() {
                return Ok(TenantId(tenant.to_string()));
            }
        }

        if let Some(query) = parts.uri.query() {
            for pair in query.split('&') {
                let mut kv = pair.splitn(2, '=');
                if let (Some("tenant_id"), Some(tenant)) = (kv.next(), kv.next()) {
                    if !tenant.is_empty() {
                        return Ok(TenantId(tenant.to_string()));
                    }
                }
            }
        }

        Ok(TenantId(DEFAULT_TENANT.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<TenantId, (StatusCode, &'static str)> {
        let (mut parts, _) = request.into_parts();
        TenantId::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_header_wins_over_query() {
        let request = Request::builder()
            .uri("/api/v1/schemas?tenant_id=from-query")
            .header(TENANT_HEADER, "from-header")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.unwrap(), TenantId("from-header".into()));
    }

    #[tokio::test]
    async fn test_query_then_default() {
        let request = Request::builder()
            .uri("/api/v1/schemas?limit=5&tenant_id=acme")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.unwrap().as_str(), "acme");

        let request = Request::builder().uri("/api/v1/schemas").body(()).unwrap();
        assert_eq!(extract(request).await.unwrap().as_str(), DEFAULT_TENANT);
    }
}
