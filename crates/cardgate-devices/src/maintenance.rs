//! Periodic subscription maintenance across all devices.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackResolver;
use crate::retry::Retrier;
use crate::subscription::SubscriptionManager;

/// Outcome of one maintenance tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Devices without a resolvable callback address
    pub skipped: usize,
}

/// Drives [`SubscriptionManager::renew_subscriptions`] for every device on a
/// fixed interval.
pub struct MaintenanceScheduler {
    manager: Arc<SubscriptionManager>,
    resolver: Arc<dyn CallbackResolver>,
    retrier: Retrier,
}

impl MaintenanceScheduler {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        resolver: Arc<dyn CallbackResolver>,
        retrier: Retrier,
    ) -> Self {
        Self {
            manager,
            resolver,
            retrier,
        }
    }

    /// Use the retry delay and budget from the manager's settings.
    pub fn with_default_retrier(
        manager: Arc<SubscriptionManager>,
        resolver: Arc<dyn CallbackResolver>,
    ) -> Self {
        let settings = manager.settings();
        let retrier = Retrier::fixed(settings.retry_delay(), settings.retry_budget());
        Self::new(manager, resolver, retrier)
    }

    /// One pass over all devices, one task per device, waiting for all.
    ///
    /// Callback resolution runs inside the device's task, so a slow lookup
    /// only delays that device.
    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut tasks = JoinSet::new();

        for device in self.manager.registry().all() {
            let manager = self.manager.clone();
            let resolver = self.resolver.clone();
            let retrier = self.retrier.clone();
            tasks.spawn(async move {
                let Some(callback) = resolver.resolve(&device).await else {
                    info!(
                        device = %device.key(),
                        "Can't maintain subscription. Don't know my own address to tell the device about it"
                    );
                    return None;
                };
                let ok = retrier
                    .run(|| manager.renew_subscriptions(&callback, &device))
                    .await;
                if !ok {
                    warn!(
                        device = %device.key(),
                        event_to = %callback,
                        "Subscriptions maintenance failed, retrying on next tick"
                    );
                }
                Some(ok)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(None) => report.skipped += 1,
                Ok(Some(ok)) => {
                    report.attempted += 1;
                    if ok {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    error!("Subscriptions maintenance task failed: {}", e);
                    report.attempted += 1;
                    report.failed += 1;
                }
            }
        }
        debug!(?report, "Subscriptions maintenance tick finished");
        report
    }

    /// Start the maintenance loop. The first tick runs after the initial
    /// delay; a tick that overruns the interval makes the next one skip.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let settings = self.manager.settings();
            let initial_delay = settings.initial_delay();
            let period = settings.maintenance_interval();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(initial_delay) => {}
            }

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "Subscriptions maintenance started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_tick().await;
                    }
                }
            }
            info!("Subscriptions maintenance stopped");
        })
    }
}
