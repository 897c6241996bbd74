//! JSON-over-HTTP remote client.

use std::marker::PhantomData;

use async_trait::async_trait;
use margin_core::{Entity, EntityId, EntityKind, ListQuery, Page, Pagination, RemoteError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{AuthConfig, ClientConfig};
use crate::RemoteClient;

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

#[derive(Serialize)]
struct BulkDeleteRequest<'a> {
    ids: &'a [EntityId],
}

#[derive(Deserialize)]
struct BulkDeleteResponse {
    deleted: u64,
}

#[derive(Serialize)]
struct BulkUpdateRequest<'a, P> {
    ids: &'a [EntityId],
    patch: &'a P,
}

/// Shared HTTP plumbing; cheap to clone.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RemoteError::network(e.to_string()))?;
        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<reqwest::Response, RemoteError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, url)
            .headers(self.auth_header.clone());
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(transport_error)
    }
}

/// [`RemoteClient`] for one entity kind over `/api/v1/{collection}`.
pub struct RestRemote<T> {
    transport: HttpTransport,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for RestRemote<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> RestRemote<T> {
    pub fn new(transport: HttpTransport) -> Self {
        Self {
            transport,
            _entity: PhantomData,
        }
    }

    fn collection_path() -> String {
        format!("/api/v1/{}", T::KIND.collection())
    }

    fn item_path(id: &EntityId) -> String {
        format!("{}/{}", Self::collection_path(), id)
    }

    async fn parse<V: DeserializeOwned>(
        response: reqwest::Response,
        id: Option<&EntityId>,
    ) -> Result<V, RemoteError> {
        let response = Self::check(response, id).await?;
        response
            .json::<V>()
            .await
            .map_err(|e| RemoteError::InvalidResponse {
                reason: e.to_string(),
            })
    }

    async fn check(
        response: reqwest::Response,
        id: Option<&EntityId>,
    ) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let error = classify_status(T::KIND, status, id, &text);
        tracing::debug!(kind = %T::KIND, status = status.as_u16(), error = %error, "request rejected");
        Err(error)
    }
}

#[async_trait]
impl<T: Entity> RemoteClient<T> for RestRemote<T> {
    async fn list(&self, query: &ListQuery, pagination: Pagination) -> Result<Page<T>, RemoteError> {
        let params = query_params(query, pagination);
        let response = self
            .transport
            .send::<()>(Method::GET, &Self::collection_path(), &params, None)
            .await?;
        Self::parse(response, None).await
    }

    async fn create(&self, input: &T::Create) -> Result<T, RemoteError> {
        let response = self
            .transport
            .send(Method::POST, &Self::collection_path(), &[], Some(input))
            .await?;
        Self::parse(response, None).await
    }

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> Result<T, RemoteError> {
        let response = self
            .transport
            .send(Method::PATCH, &Self::item_path(id), &[], Some(patch))
            .await?;
        Self::parse(response, Some(id)).await
    }

    async fn delete(&self, id: &EntityId) -> Result<(), RemoteError> {
        let response = self
            .transport
            .send::<()>(Method::DELETE, &Self::item_path(id), &[], None)
            .await?;
        Self::check(response, Some(id)).await.map(|_| ())
    }

    async fn bulk_delete(&self, ids: &[EntityId]) -> Result<u64, RemoteError> {
        let path = format!("{}/bulk-delete", Self::collection_path());
        let body = BulkDeleteRequest { ids };
        let response = self
            .transport
            .send(Method::POST, &path, &[], Some(&body))
            .await?;
        let parsed: BulkDeleteResponse = Self::parse(response, None).await?;
        Ok(parsed.deleted)
    }

    async fn bulk_update(&self, ids: &[EntityId], patch: &T::Patch) -> Result<Vec<T>, RemoteError> {
        let path = format!("{}/bulk-update", Self::collection_path());
        let body = BulkUpdateRequest { ids, patch };
        let response = self
            .transport
            .send(Method::POST, &path, &[], Some(&body))
            .await?;
        Self::parse(response, None).await
    }
}

fn query_params(query: &ListQuery, pagination: Pagination) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(status) = &query.status {
        params.push(("status", status.clone()));
    }
    if let Some(search) = query.search.as_ref().filter(|s| !s.trim().is_empty()) {
        params.push(("search", search.clone()));
    }
    if let Some(parent) = &query.parent_id {
        params.push(("parent_id", parent.to_string()));
    }
    params.push(("limit", pagination.limit.to_string()));
    params.push(("offset", pagination.offset.to_string()));
    params
}

/// Map an HTTP failure onto the error taxonomy.
fn classify_status(
    kind: EntityKind,
    status: StatusCode,
    id: Option<&EntityId>,
    body: &str,
) -> RemoteError {
    let message = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(api_error) => match api_error.code {
            Some(code) => format!("{}: {}", code, api_error.message),
            None => api_error.message,
        },
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("no reason given")
            .to_string(),
        Err(_) => body.trim().to_string(),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Unauthenticated { message }
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound {
            kind,
            id: id.cloned(),
        },
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            RemoteError::Conflict { kind, message }
        }
        _ => RemoteError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::network(format!("request timed out: {err}"));
    }
    RemoteError::network(err.to_string())
}

fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, RemoteError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| RemoteError::Unauthenticated {
                message: format!("invalid api key header: {e}"),
            })?,
        );
    }
    if let Some(token) = &auth.bearer_token {
        let value = format!("Bearer {}", token);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| RemoteError::Unauthenticated {
                message: format!("invalid bearer token header: {e}"),
            })?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use margin_core::{ErrorClass, SyncError, Task};

    fn class(err: RemoteError) -> ErrorClass {
        SyncError::from(err).class()
    }

    #[test]
    fn test_status_mapping() {
        let id = EntityId::new("srv-1");
        let kind = EntityKind::Task;
        assert_eq!(
            class(classify_status(kind, StatusCode::UNAUTHORIZED, None, "")),
            ErrorClass::Unauthenticated
        );
        assert_eq!(
            classify_status(kind, StatusCode::NOT_FOUND, Some(&id), ""),
            RemoteError::NotFound {
                kind,
                id: Some(id.clone())
            }
        );
        assert_eq!(
            class(classify_status(kind, StatusCode::PRECONDITION_FAILED, Some(&id), "")),
            ErrorClass::Conflict
        );
        assert_eq!(
            class(classify_status(kind, StatusCode::UNPROCESSABLE_ENTITY, None, "")),
            ErrorClass::Validation
        );
        assert_eq!(
            class(classify_status(kind, StatusCode::BAD_GATEWAY, None, "")),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_error_body_message_is_kept() {
        let body = r#"{"code":"TITLE_TOO_LONG","message":"title exceeds 200 characters"}"#;
        let err = classify_status(EntityKind::Note, StatusCode::BAD_REQUEST, None, body);
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 400,
                message: "TITLE_TOO_LONG: title exceeds 200 characters".to_string()
            }
        );
    }

    #[test]
    fn test_query_params_skip_empty_filters() {
        let query = ListQuery::all().with_status("active").with_search("  ");
        let params = query_params(&query, Pagination::first(25).next());
        assert_eq!(
            params,
            vec![
                ("status", "active".to_string()),
                ("limit", "25".to_string()),
                ("offset", "25".to_string()),
            ]
        );
    }

    #[test]
    fn test_paths_use_collection_name() {
        assert_eq!(RestRemote::<Task>::collection_path(), "/api/v1/tasks");
        assert_eq!(
            RestRemote::<Task>::item_path(&EntityId::new("srv-9")),
            "/api/v1/tasks/srv-9"
        );
    }

    #[test]
    fn test_auth_headers_include_both_credentials() {
        let headers = build_auth_headers(&AuthConfig {
            api_key: Some("key".to_string()),
            bearer_token: Some("token".to_string()),
        })
        .unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "key");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer token");
    }
}
