//! Event consumption orchestrator
//!
//! Keeps the set of live broker subscriptions in line with the set of
//! meters that should be consumed.
//!
//! ## Tasks
//!
//! - **reconcile loop**: owns `desired` and `applied` (both keyed by meter
//!   hash). Commands from [`OrchestratorHandle`] mutate `desired`; each tick
//!   (and each command) diffs the two maps and emits activate/deactivate
//!   signals.
//! - **dispatcher**: consumes signals one at a time and owns the leases.
//! - **lease**: one task per active meter, pulling from a durable
//!   subscription named after the meter hash and feeding the [`Aggregator`].
//!
//! A durable that still exists resumes from its own cursor. A durable that
//! has to be created for a meter which already has readings starts at the
//! stream tail, so retained events are never folded in twice.
//!
//! A slow or failing lease never blocks the dispatcher, the reconcile loop,
//! or another lease.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_common::{subject, Meter, Result, TallyError, DEFAULT_RECONCILE_INTERVAL_MS};
use tally_messaging::{Delivery, MessageChannel, StartPosition, Subscription, SubscriptionSpec};
use tally_store::MeterRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::aggregator::Aggregator;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between reconciliation passes
    pub reconcile_interval: Duration,
    /// Delete the broker-side durable when a meter stops being consumed
    pub delete_durable_on_deactivate: bool,
    /// Wait between subscription attempts
    pub resubscribe_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            delete_durable_on_deactivate: true,
            resubscribe_backoff: Duration::from_millis(1000),
        }
    }
}

enum Command {
    Add(Meter),
    Remove(String),
}

enum Signal {
    Activate(Meter),
    Deactivate(String),
}

/// Cloneable handle for changing the desired set from outside the loop
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    /// Start consuming events for a meter
    pub fn add_meter(&self, meter: Meter) -> Result<()> {
        self.send(Command::Add(meter))
    }

    /// Stop consuming events for the meter with this hash
    pub fn remove_meter(&self, hash: impl Into<String>) -> Result<()> {
        self.send(Command::Remove(hash.into()))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TallyError::Internal("orchestrator is not running".into()))
    }
}

pub struct Orchestrator {
    registry: MeterRegistry,
    aggregator: Arc<Aggregator>,
    channel: Arc<dyn MessageChannel>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: MeterRegistry,
        aggregator: Arc<Aggregator>,
        channel: Arc<dyn MessageChannel>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            aggregator,
            channel,
            config,
        }
    }

    /// Load the registered meters and spawn the orchestrator tasks.
    ///
    /// The returned join handle completes once `shutdown` fires and every
    /// lease has wound down.
    #[instrument(skip_all)]
    pub async fn start(
        self,
        shutdown: CancellationToken,
    ) -> Result<(OrchestratorHandle, JoinHandle<()>)> {
        let desired: HashMap<String, Meter> = self
            .registry
            .list()
            .await?
            .into_iter()
            .map(|meter| (meter.hash(), meter))
            .collect();
        info!(meters = desired.len(), "Loaded meters to consume");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            channel: self.channel,
            aggregator: self.aggregator,
            config: self.config.clone(),
            leases: HashMap::new(),
            retiring: HashMap::new(),
        };

        let reconciler = Reconciler {
            desired,
            applied: HashMap::new(),
            signals: signal_tx,
        };

        let interval = self.config.reconcile_interval;
        let task = tokio::spawn(async move {
            let dispatch = tokio::spawn(dispatcher.run(signal_rx, shutdown.clone()));
            reconciler.run(command_rx, interval, shutdown).await;
            if let Err(e) = dispatch.await {
                error!(error = %e, "Dispatcher task failed");
            }
            info!("Orchestrator stopped");
        });

        Ok((
            OrchestratorHandle {
                commands: command_tx,
            },
            task,
        ))
    }
}

struct Reconciler {
    desired: HashMap<String, Meter>,
    applied: HashMap<String, Meter>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Reconciler {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Reconciliation loop cancelled");
                    return;
                }
                _ = ticker.tick() => self.reconcile(),
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Add(meter)) => {
                        debug!(meter = %meter.key(), "Meter added to desired set");
                        self.desired.insert(meter.hash(), meter);
                        self.reconcile();
                    }
                    Some(Command::Remove(hash)) => {
                        debug!(hash = %hash, "Meter removed from desired set");
                        self.desired.remove(&hash);
                        self.reconcile();
                    }
                    None => commands_open = false,
                },
            }
        }
    }

    fn reconcile(&mut self) {
        for (hash, meter) in &self.desired {
            if self.applied.contains_key(hash) {
                continue;
            }
            if self.signals.send(Signal::Activate(meter.clone())).is_ok() {
                self.applied.insert(hash.clone(), meter.clone());
            }
        }

        let stale: Vec<String> = self
            .applied
            .keys()
            .filter(|hash| !self.desired.contains_key(*hash))
            .cloned()
            .collect();

        for hash in stale {
            self.applied.remove(&hash);
            let _ = self.signals.send(Signal::Deactivate(hash));
        }
    }
}

struct Lease {
    token: CancellationToken,
    retire: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct Dispatcher {
    channel: Arc<dyn MessageChannel>,
    aggregator: Arc<Aggregator>,
    config: OrchestratorConfig,
    leases: HashMap<String, Lease>,
    /// Cancelled leases still winding down, by meter hash
    retiring: HashMap<String, JoinHandle<()>>,
}

impl Dispatcher {
    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<Signal>, shutdown: CancellationToken) {
        loop {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            self.retiring.retain(|_, task| !task.is_finished());

            match signal {
                Signal::Activate(meter) => self.activate(meter, &shutdown),
                Signal::Deactivate(hash) => self.deactivate(&hash),
            }
        }

        // Leases hold child tokens of `shutdown`; wait for them to finish
        for (_, lease) in self.leases.drain() {
            lease.token.cancel();
            let _ = lease.task.await;
        }
        for (_, task) in self.retiring.drain() {
            let _ = task.await;
        }
        debug!("Dispatcher stopped");
    }

    fn activate(&mut self, meter: Meter, shutdown: &CancellationToken) {
        let hash = meter.hash();
        if self.leases.contains_key(&hash) {
            debug!(meter = %meter.key(), "Meter already active");
            return;
        }

        let token = shutdown.child_token();
        let retire = Arc::new(AtomicBool::new(false));
        let predecessor = self.retiring.remove(&hash);

        let worker = LeaseWorker {
            spec: SubscriptionSpec::new(hash.clone(), subject::event_type_filter(&meter.event_type))
                .with_description(format!("meter {}", meter.key())),
            meter,
            channel: self.channel.clone(),
            aggregator: self.aggregator.clone(),
            token: token.clone(),
            retire: retire.clone(),
            backoff: self.config.resubscribe_backoff,
        };

        let task = tokio::spawn(worker.run(predecessor));
        self.leases.insert(hash, Lease { token, retire, task });
    }

    fn deactivate(&mut self, hash: &str) {
        let Some(lease) = self.leases.remove(hash) else {
            debug!(hash, "No lease to release");
            return;
        };

        lease
            .retire
            .store(self.config.delete_durable_on_deactivate, Ordering::SeqCst);
        lease.token.cancel();
        self.retiring.insert(hash.to_string(), lease.task);
        info!(hash, "Meter deactivated");
    }
}

struct LeaseWorker {
    meter: Meter,
    spec: SubscriptionSpec,
    channel: Arc<dyn MessageChannel>,
    aggregator: Arc<Aggregator>,
    token: CancellationToken,
    retire: Arc<AtomicBool>,
    backoff: Duration,
}

impl LeaseWorker {
    #[instrument(skip_all, fields(meter = %self.meter.key(), hash = %self.spec.name))]
    async fn run(self, predecessor: Option<JoinHandle<()>>) {
        // A lease for the same hash must be gone before its durable is reused
        if let Some(previous) = predecessor {
            let _ = previous.await;
        }

        loop {
            let subscription = tokio::select! {
                _ = self.token.cancelled() => break,
                subscription = self.subscribe() => subscription,
            };

            match subscription {
                Ok(stream) => {
                    info!("Meter active");
                    if self.consume(stream).await {
                        break;
                    }
                    warn!("Subscription ended, resubscribing");
                }
                Err(e) => warn!(error = %e, "Failed to subscribe"),
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        if self.retire.load(Ordering::SeqCst) {
            match self.channel.delete_subscription(&self.spec.name).await {
                Ok(()) => info!("Durable subscription deleted"),
                Err(e) => warn!(error = %e, "Failed to delete durable subscription"),
            }
        }
        debug!("Lease released");
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let start = if self.aggregator.has_readings(&self.meter).await? {
            StartPosition::New
        } else {
            StartPosition::All
        };
        debug!(start = ?start, "Subscribing");
        self.channel
            .subscribe(&self.spec.clone().with_start(start))
            .await
    }

    /// Returns `true` when stopped by cancellation, `false` when the stream ended
    async fn consume(&self, mut stream: Subscription) -> bool {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return true,
                next = stream.next() => next,
            };

            match next {
                None => return false,
                Some(Err(e)) => warn!(error = %e, "Delivery error"),
                Some(Ok(delivery)) => self.handle(delivery).await,
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        match self.aggregator.apply_raw(&self.meter, delivery.payload.clone()).await {
            Ok(report) => debug!(
                subject = %delivery.subject,
                updated = report.updated.len(),
                failed = report.failed.len(),
                "Event applied"
            ),
            Err(e) => warn!(subject = %delivery.subject, error = %e, "Discarding unparseable message"),
        }

        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to ack message");
        }
    }
}
