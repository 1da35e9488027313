//! Background sync scheduler
//!
//! Two triggers, both active only while sync and auto-sync are enabled:
//!
//! ```text
//! NetworkMonitor ──(unavailable → available)──┐
//!                                             ├──▶ evaluate() ──▶ sync_all()
//! interval(auto_sync_interval) ──(tick)───────┘        │
//!                                                      └──▶ BackgroundSyncSkipped
//! ```
//!
//! The scheduler does not own the coordinator. It holds a weak handle to a
//! [`BackgroundSync`] target, so a dropped coordinator ends the loop.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::environment::{NetworkMonitor, NetworkState, PowerPolicy};
use crate::error::SyncResult;
use crate::events::{EventBus, SkipReason, SyncEvent};
use crate::types::{NetworkConstraint, SessionId, SyncConfiguration};

/// What the scheduler drives
#[async_trait]
pub trait BackgroundSync: Send + Sync {
    fn paired_device_count(&self) -> usize;

    fn sync_config(&self) -> SyncConfiguration;

    /// Start one session per paired device
    async fn sync_all(&self) -> SyncResult<Vec<SessionId>>;
}

/// Suitability gate. Checked in order: network, power, paired devices.
pub fn evaluate(
    network: &NetworkState,
    constraint: NetworkConstraint,
    power_sufficient: bool,
    paired_devices: usize,
) -> Result<(), SkipReason> {
    if !network.available {
        return Err(SkipReason::NetworkNotSuitable);
    }
    if constraint == NetworkConstraint::UnmeteredOnly && !network.is_unmetered() {
        return Err(SkipReason::NetworkNotSuitable);
    }
    if !power_sufficient {
        return Err(SkipReason::PowerInsufficient);
    }
    if paired_devices == 0 {
        return Err(SkipReason::NoPairedDevices);
    }
    Ok(())
}

/// Environment inputs to the scheduler
#[derive(Clone)]
pub struct Environment {
    pub network: Arc<dyn NetworkMonitor>,
    pub power: Arc<dyn PowerPolicy>,
}

/// Running scheduler task. Stops on [`stop`](SchedulerHandle::stop) or drop.
pub struct SchedulerHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Spawn the trigger loop.
    pub fn spawn(
        target: Weak<dyn BackgroundSync>,
        environment: Environment,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        // Subscribe before returning so no transition after arming is missed
        let mut network_rx = environment.network.subscribe();
        let was_available = network_rx.borrow_and_update().available;
        let task = tokio::spawn(run(
            target,
            environment,
            network_rx,
            was_available,
            events,
            interval,
            stop.clone(),
        ));
        info!(interval_secs = interval.as_secs(), "Background scheduler armed");
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Stop both triggers. Sessions already started keep running.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Background scheduler stopped");
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(
    target: Weak<dyn BackgroundSync>,
    environment: Environment,
    mut network_rx: watch::Receiver<NetworkState>,
    mut was_available: bool,
    events: EventBus,
    interval: Duration,
    stop: CancellationToken,
) {
    let period = interval.max(Duration::from_millis(1));
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = network_rx.changed() => {
                if changed.is_err() {
                    debug!("Network monitor closed, environment trigger disabled");
                    // Keep the timer trigger alive
                    let keep_going = timer_only(&target, &environment, &events, &mut timer, &stop).await;
                    if !keep_going {
                        break;
                    }
                    continue;
                }
                let available = network_rx.borrow_and_update().available;
                let became_available = available && !was_available;
                was_available = available;
                if became_available {
                    debug!("Network became available");
                    if !trigger(&target, &environment, &events).await {
                        break;
                    }
                }
            }
            _ = timer.tick() => {
                debug!("Auto-sync timer fired");
                if !trigger(&target, &environment, &events).await {
                    break;
                }
            }
        }
    }
}

async fn timer_only(
    target: &Weak<dyn BackgroundSync>,
    environment: &Environment,
    events: &EventBus,
    timer: &mut tokio::time::Interval,
    stop: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = timer.tick() => {
                if !trigger(target, environment, events).await {
                    return false;
                }
            }
        }
    }
}

/// Evaluate the gate and run a sync-all. Returns `false` once the target
/// is gone.
async fn trigger(
    target: &Weak<dyn BackgroundSync>,
    environment: &Environment,
    events: &EventBus,
) -> bool {
    let Some(target) = target.upgrade() else {
        return false;
    };

    let config = target.sync_config();
    let gate = evaluate(
        &environment.network.current(),
        config.network_constraint,
        environment.power.is_sufficient(),
        target.paired_device_count(),
    );
    if let Err(reason) = gate {
        info!(%reason, "Background sync skipped");
        events.emit(SyncEvent::BackgroundSyncSkipped { reason });
        return true;
    }

    events.emit(SyncEvent::BackgroundSyncStarted);
    match target.sync_all().await {
        Ok(sessions) => {
            info!(device_count = sessions.len(), "Background sync dispatched");
            events.emit(SyncEvent::BackgroundSyncCompleted {
                device_count: sessions.len(),
            });
        }
        Err(e) => {
            events.emit(SyncEvent::BackgroundSyncFailed {
                error: e.to_string(),
            });
        }
    }
    true
}
