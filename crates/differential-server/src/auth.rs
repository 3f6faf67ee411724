//! Bearer-secret authentication: the token is the cluster's shared secret.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::IntoResponse;

use differential_core::Cluster;

use crate::api_errors::ApiError;
use crate::state::AppState;

pub const MACHINE_ID_HEADER: &str = "x-machine-id";

/// The authenticated cluster, inserted into request extensions by
/// [`auth_middleware`].
#[derive(Clone)]
pub struct AuthedCluster(pub Arc<Cluster>);

pub fn bearer_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn machine_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MACHINE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Best-effort caller address for machine records.
pub fn peer_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    let Some(secret) = bearer_token_from_headers(&headers) else {
        return ApiError::unauthorized("missing bearer token").into_response();
    };
    match state.store.cluster_by_secret(secret) {
        Ok(Some(cluster)) => {
            request
                .extensions_mut()
                .insert(AuthedCluster(Arc::new(cluster)));
            next.run(request).await
        }
        Ok(None) => ApiError::unauthorized("unknown cluster secret").into_response(),
        Err(e) => ApiError::internal(e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token_from_headers(&headers), None);
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer my-secret"),
        );
        assert_eq!(bearer_token_from_headers(&headers), Some("my-secret"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic xyz"),
        );
        assert_eq!(bearer_token_from_headers(&headers), None);
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        assert_eq!(peer_ip_from_headers(&headers).as_deref(), Some("10.1.2.3"));
    }
}
