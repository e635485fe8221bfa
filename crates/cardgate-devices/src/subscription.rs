//! Subscription Manager
//!
//! Keeps one live event subscription per device:
//! - creates one when the device has none for our callback address
//! - replaces all of them when the newest one expired or the periodic
//!   force-resubscribe period elapsed
//! - otherwise renews the newest shortly before it expires and drops the
//!   stragglers
//!
//! Every operation on a device runs under its [`BusyGuard`](crate::BusyGuard).
//! Backend faults are logged and reported as `false`, never propagated.

use std::sync::Arc;
use std::time::Duration;

use cardgate_core::SubscriptionSettings;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendResult, CardInfo, Subscription, SubscriptionBackendClient};
use crate::callback::CallbackAddress;
use crate::registry::{DeviceConfig, DeviceRegistry};
use crate::state::FAILED;

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Failure marker for `current`, keeping an existing marker as is.
fn failure_marker(current: Option<&str>, infix: &str) -> String {
    match current {
        Some(id) if id.starts_with(FAILED) => id.to_string(),
        Some(id) => format!("{}-{}{}", FAILED, infix, id),
        None => format!("{}-subscription", FAILED),
    }
}

/// Subscribe / renew / drop decisions for every registered device.
pub struct SubscriptionManager {
    registry: Arc<DeviceRegistry>,
    backend: Arc<dyn SubscriptionBackendClient>,
    settings: SubscriptionSettings,
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        backend: Arc<dyn SubscriptionBackendClient>,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            registry,
            backend,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    /// Run the renewal algorithm for one device.
    ///
    /// Returns `true` when the device ends up with a healthy subscription,
    /// and also when another operation holds the device (nothing to do).
    pub async fn renew_subscriptions(
        &self,
        callback: &CallbackAddress,
        device: &DeviceConfig,
    ) -> bool {
        let Some(_permit) = device.guard().try_acquire() else {
            warn!(device = %device.key(), "Subscription maintenance is in progress, try later");
            return true;
        };

        let subscriptions = match self.backend.list_subscriptions(device).await {
            Ok(all) => all
                .into_iter()
                .filter(|s| callback.matches(&s.event_to))
                .collect::<Vec<_>>(),
            Err(e) => {
                error!(device = %device.key(), "Subscriptions maintenance error: {}", e);
                return false;
            }
        };

        let Some(newest) = subscriptions
            .iter()
            .max_by_key(|s| s.termination_time)
            .cloned()
        else {
            let (subscribed, _) = self.subscribe(device, callback, None).await;
            return subscribed;
        };

        let now = Utc::now();
        let expired = now >= newest.termination_time;
        let force = device
            .subscription_time()
            .checked_add_signed(to_chrono(self.settings.force_resubscribe_period()))
            .is_some_and(|deadline| deadline < now);

        if expired || force {
            let (subscribed, summary) = self.subscribe(device, callback, None).await;
            if force && subscribed {
                info!(device = %device.key(), "Force subscribed: {}", summary);
            }
            let dropped = self.drop_subscriptions(device, &subscriptions).await.is_empty();
            subscribed && dropped
        } else {
            let renewed = self.renew(device, &newest, now).await;
            let older = subscriptions
                .iter()
                .filter(|s| s.subscription_id != newest.subscription_id)
                .cloned()
                .collect::<Vec<_>>();
            let dropped = self.drop_subscriptions(device, &older).await.is_empty();
            renewed && dropped
        }
    }

    async fn renew(&self, device: &DeviceConfig, newest: &Subscription, now: DateTime<Utc>) -> bool {
        let newest_id = newest.subscription_id.as_str();
        if device.subscription_id().as_deref() != Some(newest_id) {
            warn!(
                device = %device.key(),
                config = ?device.subscription_id(),
                real = %newest_id,
                real_expiration = %newest.termination_time,
                "Found subscriptions discrepancy, updating config"
            );
            device.record_subscription(newest_id, None, false);
        }

        let safe_period = self.settings.renewal_safe_period();
        let renew_from = now
            .checked_add_signed(to_chrono(safe_period))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if renew_from < newest.termination_time {
            return true;
        }

        info!(
            device = %device.key(),
            subscription_id = %newest_id,
            "Subscription is about to expire after {} seconds, renew",
            safe_period.as_secs()
        );
        match self.backend.renew(device, newest_id).await {
            Ok(response) => match response.status.error {
                None => {
                    if let Some(renewed_id) = response.subscription_id {
                        if renewed_id != newest_id {
                            debug!(
                                device = %device.key(),
                                old = %newest_id,
                                new = %renewed_id,
                                "Subscription ID has changed after renew, updating config"
                            );
                            device.record_subscription(renewed_id, None, false);
                        }
                    }
                    true
                }
                Some(error) => {
                    warn!(device = %device.key(), "Could not renew {} -> {}", newest_id, error);
                    false
                }
            },
            Err(e) => {
                error!(device = %device.key(), "Could not renew {}: {}", newest_id, e);
                false
            }
        }
    }

    /// Create a subscription for `callback`.
    ///
    /// On failure the device state gets `failure` as its id, or a marker
    /// derived from the current id. Returns the outcome and a one-line
    /// summary of what happened.
    async fn subscribe(
        &self,
        device: &DeviceConfig,
        callback: &CallbackAddress,
        failure: Option<String>,
    ) -> (bool, String) {
        let event_to = callback.uri();
        let marker = || {
            failure
                .clone()
                .unwrap_or_else(|| failure_marker(device.subscription_id().as_deref(), ""))
        };

        match self
            .backend
            .subscribe(device, &event_to, &self.settings.topic)
            .await
        {
            Ok(response) => match (response.status.error, response.subscription_id) {
                (None, Some(subscription_id)) => {
                    let summary = format!(
                        "{} {} {}",
                        response.status.result,
                        subscription_id,
                        response
                            .termination_time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default()
                    );
                    info!(
                        device = %device.key(),
                        subscription_id = %subscription_id,
                        event_to = %event_to,
                        "Subscribe status: {}",
                        response.status.result
                    );
                    device.record_subscription(subscription_id, None, true);
                    (true, summary)
                }
                (None, None) => {
                    let summary = format!("{} without subscription id", response.status.result);
                    warn!(device = %device.key(), "Could not subscribe -> {}", summary);
                    device.record_subscription(marker(), Some(summary.clone()), false);
                    (false, summary)
                }
                (Some(error), _) => {
                    let summary = error.to_string();
                    warn!(device = %device.key(), "Could not subscribe -> {}", summary);
                    device.record_subscription(marker(), Some(summary.clone()), false);
                    (false, summary)
                }
            },
            Err(e) => {
                let summary = e.to_string();
                error!(device = %device.key(), "Could not subscribe -> {}", summary);
                device.record_subscription(marker(), Some(summary.clone()), false);
                (false, summary)
            }
        }
    }

    /// Unsubscribe each subscription independently. Returns the ids that
    /// could not be removed.
    pub async fn drop_subscriptions(
        &self,
        device: &DeviceConfig,
        subscriptions: &[Subscription],
    ) -> Vec<String> {
        let mut failed = Vec::new();
        for subscription in subscriptions {
            let id = subscription.subscription_id.as_str();
            match self.backend.unsubscribe(device, Some(id), None, false).await {
                Ok(status) => match status.error {
                    None => debug!(device = %device.key(), subscription_id = %id, "Dropped subscription"),
                    Some(error) => {
                        error!(device = %device.key(), "Failed to unsubscribe {}: {}", id, error);
                        failed.push(id.to_string());
                    }
                },
                Err(e) => {
                    error!(device = %device.key(), "Failed to unsubscribe {}: {}", id, e);
                    failed.push(id.to_string());
                }
            }
        }
        failed
    }

    /// On-demand management: unsubscribe the current subscription of every
    /// device matching `host` and optionally subscribe again.
    ///
    /// Returns one human-readable status per device.
    pub async fn manage(
        &self,
        host: Option<&str>,
        event_to_host: &str,
        force: bool,
        subscribe: bool,
    ) -> Vec<String> {
        let devices = self.registry.find_by_host(host);
        if devices.is_empty() {
            return vec![format!(
                "No configuration is found for the given host: {}",
                host.unwrap_or_default()
            )];
        }

        let mut statuses = Vec::with_capacity(devices.len());
        for device in devices {
            let Some(_permit) = device.guard().try_acquire() else {
                let kind = if subscribe { "subscription" } else { "unsubscription" };
                statuses.push(format!(
                    "[{}] Host {} is in progress, try later",
                    host.unwrap_or(device.host()),
                    kind
                ));
                continue;
            };
            let callback = CallbackAddress::new(event_to_host, device.port());
            statuses.push(self.process(&device, &callback, force, subscribe).await);
        }
        statuses
    }

    async fn process(
        &self,
        device: &DeviceConfig,
        callback: &CallbackAddress,
        force: bool,
        subscribe: bool,
    ) -> String {
        let subscription_id = device.subscription_id();
        let event_to = callback.uri();

        match self
            .backend
            .unsubscribe(device, subscription_id.as_deref(), Some(&event_to), force)
            .await
        {
            Ok(status) => match status.error {
                None => {
                    info!(
                        device = %device.key(),
                        subscription_id = ?subscription_id,
                        "Unsubscribe status: {}",
                        status.result
                    );
                    if subscribe {
                        let failure = format!("{}-subscription", FAILED);
                        let (_, summary) = self.subscribe(device, callback, Some(failure)).await;
                        summary
                    } else {
                        device.clear_subscription();
                        status.result
                    }
                }
                Some(error) => {
                    let summary = error.to_string();
                    warn!(
                        device = %device.key(),
                        "Could not unsubscribe from {:?} -> {}",
                        subscription_id,
                        summary
                    );
                    device.record_subscription(
                        failure_marker(subscription_id.as_deref(), "unsubscription-"),
                        Some(summary.clone()),
                        false,
                    );
                    summary
                }
            },
            Err(e) => {
                let summary = e.to_string();
                warn!(device = %device.key(), "Could not unsubscribe from {:?}: {}", subscription_id, summary);
                device.record_subscription(
                    failure_marker(subscription_id.as_deref(), "unsubscription-"),
                    Some(summary.clone()),
                    false,
                );
                summary
            }
        }
    }

    /// Card inventory of every device matching `host`.
    pub async fn cards(
        &self,
        host: Option<&str>,
        card_type: &str,
    ) -> Vec<(Arc<DeviceConfig>, BackendResult<Vec<CardInfo>>)> {
        let mut result = Vec::new();
        for device in self.registry.find_by_host(host) {
            let cards = self.backend.get_cards(&device, card_type).await;
            result.push((device, cards));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_marker() {
        assert_eq!(failure_marker(Some("abc"), ""), "failed-abc");
        assert_eq!(
            failure_marker(Some("abc"), "unsubscription-"),
            "failed-unsubscription-abc"
        );
        assert_eq!(failure_marker(Some("failed-abc"), "unsubscription-"), "failed-abc");
        assert_eq!(failure_marker(None, ""), "failed-subscription");
    }
}
