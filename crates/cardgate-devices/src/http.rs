//! HTTP bridge to the device event service.
//!
//! Talks JSON to `<connector_url>/eventservice/...` of each device.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{
    BackendError, BackendResult, CardInfo, RenewResponse, Status, SubscribeResponse, Subscription,
    SubscriptionBackendClient,
};
use crate::registry::DeviceConfig;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest<'a> {
    event_to: &'a str,
    topic: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribeRequest<'a> {
    #[serde(rename = "subscriptionID", skip_serializing_if = "Option::is_none")]
    subscription_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_to: Option<&'a str>,
    force: bool,
}

/// [`SubscriptionBackendClient`] over HTTPS + JSON.
#[derive(Debug, Clone)]
pub struct HttpSubscriptionBackend {
    client: Client,
}

impl HttpSubscriptionBackend {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn url(device: &DeviceConfig, path: &str) -> String {
        format!("{}/eventservice/{}", device.connector_url(), path)
    }

    async fn execute<T: DeserializeOwned>(request: RequestBuilder) -> BackendResult<T> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(format!("JSON parse error: {}", e)))
    }
}

impl Default for HttpSubscriptionBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(cardgate_core::config::defaults::HTTP_TIMEOUT_SECS))
    }
}

#[async_trait]
impl SubscriptionBackendClient for HttpSubscriptionBackend {
    async fn list_subscriptions(&self, device: &DeviceConfig) -> BackendResult<Vec<Subscription>> {
        Self::execute(self.client.get(Self::url(device, "subscriptions"))).await
    }

    async fn subscribe(
        &self,
        device: &DeviceConfig,
        event_to: &str,
        topic: &str,
    ) -> BackendResult<SubscribeResponse> {
        let request = self
            .client
            .post(Self::url(device, "subscriptions"))
            .json(&SubscribeRequest { event_to, topic });
        Self::execute(request).await
    }

    async fn renew(
        &self,
        device: &DeviceConfig,
        subscription_id: &str,
    ) -> BackendResult<RenewResponse> {
        let path = format!("subscriptions/{}/renew", subscription_id);
        Self::execute(self.client.post(Self::url(device, &path))).await
    }

    async fn unsubscribe(
        &self,
        device: &DeviceConfig,
        subscription_id: Option<&str>,
        event_to: Option<&str>,
        force: bool,
    ) -> BackendResult<Status> {
        let request = self
            .client
            .post(Self::url(device, "unsubscribe"))
            .json(&UnsubscribeRequest {
                subscription_id,
                event_to,
                force,
            });
        Self::execute(request).await
    }

    async fn get_cards(
        &self,
        device: &DeviceConfig,
        card_type: &str,
    ) -> BackendResult<Vec<CardInfo>> {
        let request = self
            .client
            .get(Self::url(device, "cards"))
            .query(&[("cardType", card_type)]);
        Self::execute(request).await
    }
}
