//! Message-store REST client.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StoreError;
use crate::models::{ConversationKey, ConversationSummary, MessageRecord, PinnedMessage};

/// Body of `POST /messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub content: String,
    pub target: ConversationKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Conversations ordered by recency, with last message and unread count
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Full history snapshot of one conversation
    async fn fetch_messages(&self, key: &ConversationKey) -> Result<Vec<MessageRecord>, StoreError>;

    async fn send_message(&self, request: &SendRequest) -> Result<MessageRecord, StoreError>;

    async fn edit_message(&self, id: &str, content: &str) -> Result<MessageRecord, StoreError>;

    async fn delete_message(&self, id: &str) -> Result<(), StoreError>;

    async fn list_pins(&self, key: &ConversationKey) -> Result<Vec<PinnedMessage>, StoreError>;

    async fn pin_message(
        &self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Result<PinnedMessage, StoreError>;

    async fn unpin_message(&self, key: &ConversationKey, pin_id: &str) -> Result<(), StoreError>;
}

/// `MessageStore` over the service's JSON REST surface
pub struct HttpMessageStore {
    base_url: reqwest::Url,
    token: String,
    client: reqwest::Client,
}

impl HttpMessageStore {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let base_url = base_url.into();
        let parsed = reqwest::Url::parse(&base_url)
            .map_err(|e| StoreError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(base_url));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: parsed,
            token: token.into(),
            client,
        })
    }

    /// Base URL with `segments` appended, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.token))
    }

    /// Send and fail on non-success status, keeping the body for the error.
    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<String, StoreError> {
        let response = self.authorized(builder).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, StoreError> {
        let body = self.execute(builder).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        debug!("GET /conversations");
        self.execute_json(self.client.get(self.url(&["conversations"])))
            .await
    }

    async fn fetch_messages(
        &self,
        key: &ConversationKey,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        debug!("GET /messages/{}", key);
        let key = key.to_string();
        self.execute_json(self.client.get(self.url(&["messages", &key])))
            .await
    }

    async fn send_message(&self, request: &SendRequest) -> Result<MessageRecord, StoreError> {
        debug!("POST /messages (target {})", request.target);
        self.execute_json(self.client.post(self.url(&["messages"])).json(request))
            .await
    }

    async fn edit_message(&self, id: &str, content: &str) -> Result<MessageRecord, StoreError> {
        debug!("PUT /messages/{}", id);
        let body = serde_json::json!({ "content": content });
        self.execute_json(
            self.client
                .put(self.url(&["messages", id]))
                .json(&body),
        )
        .await
    }

    async fn delete_message(&self, id: &str) -> Result<(), StoreError> {
        debug!("DELETE /messages/{}", id);
        self.execute(self.client.delete(self.url(&["messages", id])))
            .await
            .map(|_| ())
    }

    async fn list_pins(&self, key: &ConversationKey) -> Result<Vec<PinnedMessage>, StoreError> {
        debug!("GET /pins/{}", key);
        let key = key.to_string();
        self.execute_json(self.client.get(self.url(&["pins", &key])))
            .await
    }

    async fn pin_message(
        &self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Result<PinnedMessage, StoreError> {
        debug!("POST /pins/{} ({})", key, message_id);
        let body = serde_json::json!({ "messageId": message_id });
        self.execute_json(
            self.client
                .post(self.url(&["pins", &key.to_string()]))
                .json(&body),
        )
        .await
    }

    async fn unpin_message(&self, key: &ConversationKey, pin_id: &str) -> Result<(), StoreError> {
        debug!("DELETE /pins/{}/{}", key, pin_id);
        self.execute(
            self.client
                .delete(self.url(&["pins", &key.to_string(), pin_id])),
        )
        .await
        .map(|_| ())
    }
}
