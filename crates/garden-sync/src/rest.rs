use crate::error::RestError;
use async_trait::async_trait;
use garden_core::{Device, Notification, NotificationPage, UserProfile};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplies the bearer token for REST calls and the channel handshake.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|token| !token.trim().is_empty()))
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// REST snapshots the sync layer reconciles against.
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn current_user(&self) -> Result<UserProfile, RestError>;

    async fn notifications(
        &self,
        user_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<NotificationPage, RestError>;

    async fn mark_notification_read(&self, id: &str) -> Result<(), RestError>;

    async fn devices_for_location(&self, location_id: &str) -> Result<Vec<Device>, RestError>;
}

/// The endpoint has returned both a bare list and a paginated object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NotificationsResponse {
    List(Vec<Notification>),
    Page(NotificationPage),
}

impl From<NotificationsResponse> for NotificationPage {
    fn from(response: NotificationsResponse) -> Self {
        match response {
            NotificationsResponse::List(notifications) => NotificationPage {
                notifications,
                pagination: None,
            },
            NotificationsResponse::Page(page) => page,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DevicesResponse {
    List(Vec<Device>),
    Wrapped { devices: Vec<Device> },
}

impl From<DevicesResponse> for Vec<Device> {
    fn from(response: DevicesResponse) -> Self {
        match response {
            DevicesResponse::List(devices) => devices,
            DevicesResponse::Wrapped { devices } => devices,
        }
    }
}

pub struct HttpRestApi {
    http: Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
}

impl HttpRestApi {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenSource>) -> Result<Self, RestError> {
        let base_url = Url::parse(base_url).map_err(|err| RestError::Url(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(RestError::Url(format!("{base_url} cannot be a base url")));
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| RestError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            tokens,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RestError> {
        endpoint(&self.base_url, segments)
    }

    async fn authorized(&self, method: Method, url: Url) -> Result<RequestBuilder, RestError> {
        let token = self.tokens.token().await.ok_or(RestError::MissingToken)?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RestError> {
        let response = request
            .send()
            .await
            .map_err(|err| RestError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(
                event = "sync_rest_status",
                status = status.as_u16(),
                message = %message
            );
            return Err(RestError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RestError> {
        debug!(event = "sync_rest_request", method = "GET", url = %url);
        let request = self.authorized(Method::GET, url).await?;
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|err| RestError::Decode(err.to_string()))
    }
}

#[async_trait]
impl RestApi for HttpRestApi {
    async fn current_user(&self) -> Result<UserProfile, RestError> {
        let url = self.endpoint(&["api", "users", "me"])?;
        self.get_json(url).await
    }

    async fn notifications(
        &self,
        user_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<NotificationPage, RestError> {
        let mut url = self.endpoint(&["api", "notifications", user_id])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &page_size.to_string());
        let response: NotificationsResponse = self.get_json(url).await?;
        Ok(response.into())
    }

    async fn mark_notification_read(&self, id: &str) -> Result<(), RestError> {
        let url = self.endpoint(&["api", "notifications", id, "read"])?;
        debug!(event = "sync_rest_request", method = "PUT", url = %url);
        let request = self.authorized(Method::PUT, url).await?;
        self.send(request).await?;
        Ok(())
    }

    async fn devices_for_location(&self, location_id: &str) -> Result<Vec<Device>, RestError> {
        let url = self.endpoint(&["api", "locations", location_id, "devices"])?;
        let response: DevicesResponse = self.get_json(url).await?;
        Ok(response.into())
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, RestError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| RestError::Url(format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoints_escape_identifiers() {
        let base = Url::parse("https://garden.example/").expect("base");
        let url = endpoint(&base, &["api", "notifications", "a b@x"]).expect("url");
        assert!(url.path().starts_with("/api/notifications/a%20b"));

        let prefixed = Url::parse("https://garden.example/v2").expect("base");
        let url = endpoint(&prefixed, &["api", "users", "me"]).expect("url");
        assert_eq!(url.path(), "/v2/api/users/me");
    }

    #[test]
    fn notifications_accept_list_and_page_shapes() {
        let item = json!({
            "id": "n1",
            "senderId": "system",
            "receiverId": "a@x",
            "message": "soil dry",
            "createdAt": "2026-03-01T10:00:00Z"
        });
        let list: NotificationsResponse =
            serde_json::from_value(json!([item.clone()])).expect("list");
        let page: NotificationPage = list.into();
        assert_eq!(page.notifications.len(), 1);
        assert!(page.pagination.is_none());

        let wrapped: NotificationsResponse = serde_json::from_value(json!({
            "notifications": [item],
            "pagination": {"totalCount": 12, "pageSize": 10, "currentPage": 1}
        }))
        .expect("page");
        let page: NotificationPage = wrapped.into();
        assert_eq!(page.pagination.map(|meta| meta.total_count), Some(12));
    }

    #[test]
    fn http_client_rejects_non_base_urls() {
        let tokens: Arc<dyn TokenSource> = Arc::new(StaticToken::new(Some("t".into())));
        assert!(matches!(
            HttpRestApi::new("mailto:ops@garden.example", Arc::clone(&tokens)),
            Err(RestError::Url(_))
        ));
        assert!(HttpRestApi::new("http://127.0.0.1:4000", tokens).is_ok());
    }

    #[tokio::test]
    async fn blank_static_token_counts_as_missing() {
        assert_eq!(StaticToken::new(Some("  ".into())).token().await, None);
        assert_eq!(
            StaticToken::new(Some("abc".into())).token().await.as_deref(),
            Some("abc")
        );
    }
}
