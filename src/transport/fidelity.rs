//! Fidelity controller
//!
//! Samples data channel health on a fixed interval and publishes a discrete
//! quality level. Downgrades are automatic: any tracked channel that is not
//! open forces `UltraLow` on the next evaluation. Upgrades are not: a level
//! only goes up through [`FidelityController::set_fidelity`], and a request
//! made while a channel is unhealthy waits until all channels are healthy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::events::EventBus;

/// Quality tier for payload size/resolution, ordered lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FidelityLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for FidelityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FidelityLevel::UltraLow => write!(f, "ULTRA_LOW"),
            FidelityLevel::Low => write!(f, "LOW"),
            FidelityLevel::Medium => write!(f, "MEDIUM"),
            FidelityLevel::High => write!(f, "HIGH"),
        }
    }
}

impl std::str::FromStr for FidelityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "ULTRA_LOW" => Ok(FidelityLevel::UltraLow),
            "LOW" => Ok(FidelityLevel::Low),
            "MEDIUM" => Ok(FidelityLevel::Medium),
            "HIGH" => Ok(FidelityLevel::High),
            other => Err(format!("unknown fidelity level: {}", other)),
        }
    }
}

/// Snapshot of data channel health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelHealth {
    pub tracked: usize,
    pub unhealthy: usize,
}

impl ChannelHealth {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy == 0
    }
}

/// Anything that can report the health of its tracked data channels
#[async_trait]
pub trait HealthSource: Send + Sync + 'static {
    async fn channel_health(&self) -> ChannelHealth;
}

struct Inner {
    health: Arc<dyn HealthSource>,
    events: EventBus,
    current: watch::Sender<FidelityLevel>,
    requested: Mutex<Option<FidelityLevel>>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct FidelityController {
    inner: Arc<Inner>,
}

impl FidelityController {
    pub fn new(health: Arc<dyn HealthSource>, events: EventBus, initial: FidelityLevel) -> Self {
        let (current, _) = watch::channel(initial);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                health,
                events,
                current,
                requested: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Start evaluating every `interval` until [`shutdown`](Self::shutdown)
    pub fn spawn(&self, interval: Duration) -> JoinHandle<()> {
        let controller = self.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Fidelity controller stopped");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        controller.evaluate().await;
                    }
                }
            }
        })
    }

    pub fn current(&self) -> FidelityLevel {
        *self.inner.current.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<FidelityLevel> {
        self.inner.current.subscribe()
    }

    /// Request a level. Applied at once when every tracked channel is open,
    /// otherwise held until the first healthy evaluation.
    pub async fn set_fidelity(&self, level: FidelityLevel) -> FidelityLevel {
        *self.inner.requested.lock().await = Some(level);
        debug!("Fidelity {} requested", level);
        self.evaluate().await
    }

    /// Run one evaluation and return the resulting level
    pub async fn evaluate(&self) -> FidelityLevel {
        let mut requested = self.inner.requested.lock().await;
        let health = self.inner.health.channel_health().await;
        let current = self.current();

        let next = if !health.is_healthy() {
            FidelityLevel::UltraLow
        } else if let Some(level) = requested.take() {
            level
        } else {
            current
        };

        if next != current {
            info!(
                "Fidelity {} -> {} ({} tracked, {} unhealthy)",
                current, next, health.tracked, health.unhealthy
            );
            self.inner.current.send_replace(next);
            self.inner.events.fidelity_changed(next);
        }
        next
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHealth {
        tracked: AtomicUsize,
        unhealthy: AtomicUsize,
    }

    impl FakeHealth {
        fn set(&self, tracked: usize, unhealthy: usize) {
            self.tracked.store(tracked, Ordering::SeqCst);
            self.unhealthy.store(unhealthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HealthSource for FakeHealth {
        async fn channel_health(&self) -> ChannelHealth {
            ChannelHealth {
                tracked: self.tracked.load(Ordering::SeqCst),
                unhealthy: self.unhealthy.load(Ordering::SeqCst),
            }
        }
    }

    fn controller(initial: FidelityLevel) -> (Arc<FakeHealth>, EventBus, FidelityController) {
        let health = Arc::new(FakeHealth::default());
        let events = EventBus::new(16);
        let controller = FidelityController::new(health.clone(), events.clone(), initial);
        (health, events, controller)
    }

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(FidelityLevel::UltraLow < FidelityLevel::Low);
        assert!(FidelityLevel::Medium >= FidelityLevel::Low);
        assert!(FidelityLevel::High > FidelityLevel::Medium);
        assert_eq!("ultra-low".parse::<FidelityLevel>(), Ok(FidelityLevel::UltraLow));
        assert_eq!("HIGH".parse::<FidelityLevel>(), Ok(FidelityLevel::High));
        assert!("max".parse::<FidelityLevel>().is_err());
        assert_eq!(
            serde_json::to_string(&FidelityLevel::UltraLow).unwrap(),
            "\"ULTRA_LOW\""
        );
    }

    #[tokio::test]
    async fn test_healthy_tick_keeps_level() {
        let (health, _events, controller) = controller(FidelityLevel::Low);
        health.set(2, 0);
        assert_eq!(controller.evaluate().await, FidelityLevel::Low);
    }

    #[tokio::test]
    async fn test_unhealthy_channel_forces_ultra_low() {
        let (health, events, controller) = controller(FidelityLevel::Low);
        let mut changes = events.subscribe_fidelity();

        health.set(2, 1);
        assert_eq!(controller.evaluate().await, FidelityLevel::UltraLow);
        assert_eq!(changes.recv().await.unwrap(), FidelityLevel::UltraLow);

        // Same level again does not re-fire
        controller.evaluate().await;
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_after_downgrade_waits_for_health() {
        let (health, _events, controller) = controller(FidelityLevel::Low);
        health.set(1, 1);
        controller.evaluate().await;

        assert_eq!(
            controller.set_fidelity(FidelityLevel::High).await,
            FidelityLevel::UltraLow
        );
        assert_eq!(controller.evaluate().await, FidelityLevel::UltraLow);

        health.set(1, 0);
        assert_eq!(controller.evaluate().await, FidelityLevel::High);
    }

    #[tokio::test]
    async fn test_recovery_without_request_does_not_upgrade() {
        let (health, _events, controller) = controller(FidelityLevel::Medium);
        health.set(1, 1);
        controller.evaluate().await;
        health.set(1, 0);
        assert_eq!(controller.evaluate().await, FidelityLevel::UltraLow);
    }

    #[tokio::test]
    async fn test_downgrade_overrides_prior_request() {
        let (health, _events, controller) = controller(FidelityLevel::Low);
        health.set(1, 0);
        assert_eq!(
            controller.set_fidelity(FidelityLevel::High).await,
            FidelityLevel::High
        );

        health.set(1, 1);
        assert_eq!(controller.evaluate().await, FidelityLevel::UltraLow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks() {
        let (health, _events, controller) = controller(FidelityLevel::High);
        let handle = controller.spawn(Duration::from_secs(4));

        health.set(3, 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.current(), FidelityLevel::UltraLow);

        controller.shutdown();
        handle.await.unwrap();
    }
}
