use crate::extractors::RejectionType;
use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{request::Parts, StatusCode},
};
use log::*;
use sse::{ClientId, ConnectionId};
use std::collections::HashMap;
use std::sync::Arc;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const CLIENT_ID_QUERY_PARAM: &str = "client_id";

/// Decides which logical client a stream request belongs to.
///
/// Returning `Ok(None)` means "no identity supplied"; the request then gets a
/// fresh anonymous id. Returning `Err` rejects the request outright, which is
/// how an authenticating resolver refuses unauthenticated streams.
pub trait ClientIdResolver: Send + Sync {
    fn resolve(&self, parts: &Parts) -> Result<Option<ClientId>, RejectionType>;
}

/// `X-Client-Id` header first, then the `client_id` query parameter.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderOrQueryResolver;

impl ClientIdResolver for HeaderOrQueryResolver {
    fn resolve(&self, parts: &Parts) -> Result<Option<ClientId>, RejectionType> {
        if let Some(value) = parts.headers.get(CLIENT_ID_HEADER) {
            let client_id = value.to_str().map_err(|_| {
                (
                    StatusCode::BAD_REQUEST,
                    format!("{CLIENT_ID_HEADER} must be visible ASCII"),
                )
            })?;
            if !client_id.trim().is_empty() {
                return Ok(Some(client_id.trim().to_string()));
            }
        }

        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        Ok(query
            .0
            .get(CLIENT_ID_QUERY_PARAM)
            .map(|client_id| client_id.trim())
            .filter(|client_id| !client_id.is_empty())
            .map(str::to_string))
    }
}

/// The client id a stream request resolved to.
pub(crate) struct ClientIdentity(pub ClientId);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = RejectionType;

    // The resolver is installed on the stream routes as an Extension; without
    // one, fall back to header/query resolution.
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resolver = parts
            .extensions
            .get::<Arc<dyn ClientIdResolver>>()
            .cloned()
            .unwrap_or_else(|| Arc::new(HeaderOrQueryResolver) as Arc<dyn ClientIdResolver>);

        match resolver.resolve(parts)? {
            Some(client_id) => Ok(ClientIdentity(client_id)),
            None => {
                let client_id = format!("anonymous-{}", ConnectionId::new());
                trace!("No client id supplied, assigned {client_id}");
                Ok(ClientIdentity(client_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, client_header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = client_header {
            builder = builder.header(CLIENT_ID_HEADER, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_header_takes_precedence_over_query() {
        let resolved = HeaderOrQueryResolver
            .resolve(&parts("/sse?client_id=from-query", Some("from-header")))
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("from-header"));
    }

    #[test]
    fn test_query_is_used_without_header() {
        let resolved = HeaderOrQueryResolver
            .resolve(&parts("/sse?client_id=user-42", None))
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("user-42"));
    }

    #[test]
    fn test_blank_values_resolve_to_none() {
        let resolved = HeaderOrQueryResolver
            .resolve(&parts("/sse?client_id=%20", Some("  ")))
            .unwrap();
        assert_eq!(resolved, None);
    }

    struct DenyAll;

    impl ClientIdResolver for DenyAll {
        fn resolve(&self, _parts: &Parts) -> Result<Option<ClientId>, RejectionType> {
            Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string()))
        }
    }

    #[tokio::test]
    async fn test_extractor_uses_installed_resolver() {
        let mut parts = parts("/sse?client_id=user-42", None);
        parts
            .extensions
            .insert(Arc::new(DenyAll) as Arc<dyn ClientIdResolver>);

        let rejection = ClientIdentity::from_request_parts(&mut parts, &())
            .await
            .err()
            .unwrap();
        assert_eq!(rejection.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_extractor_assigns_anonymous_ids() {
        let mut first_parts = parts("/sse", None);
        let mut second_parts = parts("/sse", None);

        let ClientIdentity(first) = ClientIdentity::from_request_parts(&mut first_parts, &())
            .await
            .unwrap();
        let ClientIdentity(second) = ClientIdentity::from_request_parts(&mut second_parts, &())
            .await
            .unwrap();

        assert!(first.starts_with("anonymous-"));
        assert_ne!(first, second);
    }
}
