//! End-to-end metering tests
//!
//! Runs the service over the in-memory KV backend and in-memory channel:
//! - meter registration and ingress validation
//! - sum/avg/duration/unique readings built from published events
//! - meter deactivation and reactivation

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tally_common::{AggregationKind, Event, Meter, Reading, Segment, TallyError};
use tally_engine::{MeteringService, OrchestratorConfig};
use tally_messaging::MemoryChannel;
use tally_store::{MemoryKvBackend, MeterRegistry, ReadingStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    service: MeteringService,
    channel: MemoryChannel,
    registry: MeterRegistry,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(config: OrchestratorConfig) -> Self {
        let registry = MeterRegistry::new(Arc::new(MemoryKvBackend::new("meters")));
        let readings = ReadingStore::new(Arc::new(MemoryKvBackend::new("readings")));
        Self::start_with(registry, readings, MemoryChannel::new(), config).await
    }

    async fn start_with(
        registry: MeterRegistry,
        readings: ReadingStore,
        channel: MemoryChannel,
        config: OrchestratorConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (service, task) = tally_engine::start(
            registry.clone(),
            readings,
            Arc::new(channel.clone()),
            config,
            shutdown.clone(),
        )
        .await
        .unwrap();

        Self {
            service,
            channel,
            registry,
            shutdown,
            task,
        }
    }

    async fn add(&self, meter: &Meter) {
        self.service.register_meter(meter).await.unwrap();
        self.service.add_meter_to_consume(meter.clone()).unwrap();
        let name = meter.hash();
        eventually(|| async { self.channel.live_subscriptions(&name) == 1 }).await;
    }

    async fn reading(&self, key: &str) -> Reading {
        self.service.get_reading(key).await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("orchestrator did not stop")
            .unwrap();
    }
}

fn fast() -> OrchestratorConfig {
    OrchestratorConfig {
        reconcile_interval: Duration::from_millis(20),
        resubscribe_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn wait_for_count(service: &MeteringService, key: &str, count: u64) {
    eventually(|| async {
        service
            .get_reading(key)
            .await
            .map(|r| r.count == count)
            .unwrap_or(false)
    })
    .await;
}

fn call(id: &str, bytes: i64) -> Event {
    Event::new(id, "api_call", "cust-1").with_data("bytes", bytes)
}

#[tokio::test]
async fn test_sum_meter_scenario() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Sum, "$.bytes");
    h.add(&meter).await;

    for (id, bytes) in [("e1", 10), ("e2", 20), ("e3", 30)] {
        h.service.publish_event(call(id, bytes)).await.unwrap();
    }

    wait_for_count(&h.service, "api_call.sum.m1.cust-1", 3).await;
    let reading = h.reading("api_call.sum.m1.cust-1").await;
    assert_eq!(reading.sum, 60.0);
    assert_eq!(reading.meter_id, "m1");
    assert_eq!(reading.kind, AggregationKind::Sum);

    h.stop().await;
}

#[tokio::test]
async fn test_avg_meter_scenario() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Avg, "$.bytes");
    h.add(&meter).await;

    for (id, bytes) in [("e1", 10), ("e2", 20), ("e3", 30)] {
        h.service.publish_event(call(id, bytes)).await.unwrap();
    }

    wait_for_count(&h.service, "api_call.avg.m1.cust-1", 3).await;
    let reading = h.reading("api_call.avg.m1.cust-1").await;
    assert!((reading.avg - 20.0).abs() < 1e-9);

    h.stop().await;
}

#[tokio::test]
async fn test_duration_meter_uses_event_time() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("gpu", "gpu_usage", AggregationKind::Duration, "$.cards");
    h.add(&meter).await;

    let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let t2 = t1 + ChronoDuration::hours(2);
    let t3 = t2 + ChronoDuration::minutes(30);
    for (id, cards, at) in [("e1", 2, t1), ("e2", 4, t2), ("e3", 1, t3)] {
        let event = Event::new(id, "gpu_usage", "node-7")
            .with_data("cards", cards)
            .with_time(at);
        h.service.publish_event(event).await.unwrap();
    }

    let key = "gpu_usage.duration.gpu.node-7";
    wait_for_count(&h.service, key, 3).await;
    let data = h.reading(key).await.duration_data.unwrap();
    assert!((data.total - (2.0 * 2.0 + 0.5 * 4.0)).abs() < 1e-9);
    assert_eq!(data.unit, 1.0);
    assert_eq!(data.last_calculated, t3);

    h.stop().await;
}

#[tokio::test]
async fn test_unique_meter_with_groups() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("users", "login", AggregationKind::Unique, "$.user")
        .with_group("region", "$.region");
    h.add(&meter).await;

    let logins = [("e1", "ann", "eu"), ("e2", "bob", "eu"), ("e3", "ann", "us"), ("e4", "ann", "eu")];
    for (id, user, region) in logins {
        let event = Event::new(id, "login", "tenant-1")
            .with_data("user", user)
            .with_data("region", region);
        h.service.publish_event(event).await.unwrap();
    }

    let us_key = Reading::key(&meter, "tenant-1", &Segment::group("region", "us"));
    let eu_key = Reading::key(&meter, "tenant-1", &Segment::group("region", "eu"));
    eventually(|| async {
        let eu = h.service.get_reading(&eu_key).await;
        let us = h.service.get_reading(&us_key).await;
        matches!((eu, us), (Ok(eu), Ok(_)) if eu.unique.values().sum::<u64>() == 3)
    })
    .await;

    let base = h.reading("login.unique.users.tenant-1").await;
    assert_eq!(base.distinct(), 2);
    assert_eq!(base.unique["ann"], 3);
    assert_eq!(base.unique["bob"], 1);

    let eu = h.reading(&eu_key).await;
    assert_eq!(eu.distinct(), 2);
    assert_eq!(eu.group_value.as_deref(), Some("eu"));

    let grouped = h
        .service
        .list_readings("login.unique.users.tenant-1.region.*")
        .await
        .unwrap();
    assert_eq!(grouped.len(), 2);

    h.stop().await;
}

#[tokio::test]
async fn test_ingress_validation() {
    let h = Harness::start(fast()).await;
    h.add(&Meter::new("m1", "api_call", AggregationKind::Count, "$.bytes")).await;

    let bad = Event::new("e1", "api_call", "cust 1");
    let err = h.service.publish_event(bad).await.unwrap_err();
    assert!(matches!(err, TallyError::Validation(_)));

    let unmetered = Event::new("e2", "upload", "cust-1");
    let err = h.service.publish_event(unmetered).await.unwrap_err();
    assert!(matches!(err, TallyError::NotFound(_)));

    assert!(h.channel.published().is_empty());

    let accepted = h.service.publish_event(call("e3", 1)).await.unwrap();
    assert!(accepted.time.is_some());
    assert_eq!(h.channel.published()[0].subject, "events.api_call.cust-1.e3");

    h.stop().await;
}

#[tokio::test]
async fn test_duplicate_event_id_is_counted_once() {
    let h = Harness::start(fast()).await;
    h.add(&Meter::new("m1", "api_call", AggregationKind::Sum, "$.bytes")).await;

    h.service.publish_event(call("e1", 5)).await.unwrap();
    h.service.publish_event(call("e1", 5)).await.unwrap();
    h.service.publish_event(call("e2", 5)).await.unwrap();

    wait_for_count(&h.service, "api_call.sum.m1.cust-1", 2).await;
    assert_eq!(h.reading("api_call.sum.m1.cust-1").await.sum, 10.0);

    h.stop().await;
}

#[tokio::test]
async fn test_duplicate_registration() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Sum, "$.bytes");
    h.service.register_meter(&meter).await.unwrap();

    let err = h
        .service
        .register_meter(&meter.clone().with_description("changed"))
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::AlreadyExists(_)));
    assert_eq!(h.service.get_meter(&meter.key()).await.unwrap(), meter);

    h.stop().await;
}

#[tokio::test]
async fn test_failed_aggregation_is_dead_lettered() {
    let h = Harness::start(fast()).await;
    h.add(&Meter::new("m1", "api_call", AggregationKind::Sum, "$.bytes")).await;

    let event = Event::new("e1", "api_call", "cust-1").with_data("bytes", "lots");
    h.service.publish_event(event).await.unwrap();

    eventually(|| async { h.channel.published_matching("events.errors.>").len() == 1 }).await;
    let dead = &h.channel.published_matching("events.errors.>")[0];
    assert_eq!(dead.subject, "events.errors.api_call.cust-1.e1");
    assert!(h.service.list_readings(">").await.unwrap().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_reactivation_resumes_existing_reading() {
    let config = OrchestratorConfig {
        delete_durable_on_deactivate: false,
        ..fast()
    };
    let h = Harness::start(config).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Count, "$.bytes");
    h.add(&meter).await;

    h.service.publish_event(call("e1", 1)).await.unwrap();
    h.service.publish_event(call("e2", 1)).await.unwrap();
    wait_for_count(&h.service, "api_call.count.m1.cust-1", 2).await;

    h.service.remove_meter_from_consume(&meter.hash()).unwrap();
    eventually(|| async { h.channel.live_subscriptions(&meter.hash()) == 0 }).await;
    assert_eq!(h.channel.durables(), vec![meter.hash()]);

    h.service.add_meter_to_consume(meter.clone()).unwrap();
    eventually(|| async { h.channel.live_subscriptions(&meter.hash()) == 1 }).await;
    h.service.publish_event(call("e3", 1)).await.unwrap();

    wait_for_count(&h.service, "api_call.count.m1.cust-1", 3).await;
    assert_eq!(h.service.list_readings(">").await.unwrap().len(), 1);

    // No replay of already-consumed events
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.reading("api_call.count.m1.cust-1").await.count, 3);

    h.stop().await;
}

#[tokio::test]
async fn test_reactivation_after_durable_deletion_does_not_replay() {
    let config = OrchestratorConfig::default();
    assert!(config.delete_durable_on_deactivate);
    let h = Harness::start(config).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Sum, "$.bytes");
    h.add(&meter).await;

    for (id, bytes) in [("e1", 10), ("e2", 20), ("e3", 30)] {
        h.service.publish_event(call(id, bytes)).await.unwrap();
    }
    wait_for_count(&h.service, "api_call.sum.m1.cust-1", 3).await;

    h.service.remove_meter_from_consume(&meter.hash()).unwrap();
    eventually(|| async { h.channel.durables().is_empty() }).await;

    h.service.add_meter_to_consume(meter.clone()).unwrap();
    eventually(|| async { h.channel.live_subscriptions(&meter.hash()) == 1 }).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reading = h.reading("api_call.sum.m1.cust-1").await;
    assert_eq!(reading.sum, 60.0);
    assert_eq!(reading.count, 3);

    // Later events keep updating the same reading
    h.service.publish_event(call("e4", 40)).await.unwrap();
    wait_for_count(&h.service, "api_call.sum.m1.cust-1", 4).await;
    assert_eq!(h.reading("api_call.sum.m1.cust-1").await.sum, 100.0);

    h.stop().await;
}

#[tokio::test]
async fn test_repeated_add_keeps_single_subscription() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Count, "$.bytes");
    h.add(&meter).await;

    for _ in 0..3 {
        h.service.add_meter_to_consume(meter.clone()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.channel.live_subscriptions(&meter.hash()), 1);

    h.service.publish_event(call("e1", 1)).await.unwrap();
    wait_for_count(&h.service, "api_call.count.m1.cust-1", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.reading("api_call.count.m1.cust-1").await.count, 1);

    h.stop().await;
}

#[tokio::test]
async fn test_deactivation_deletes_durable() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Count, "$.bytes");
    h.add(&meter).await;
    assert_eq!(h.channel.durables(), vec![meter.hash()]);

    let deleted = h.service.delete_meter(&meter.key()).await.unwrap();
    h.service.remove_meter_from_consume(&deleted.hash()).unwrap();

    eventually(|| async { h.channel.durables().is_empty() }).await;
    assert!(h.service.list_meters().await.unwrap().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_registered_meters_consumed_on_start() {
    let registry = MeterRegistry::new(Arc::new(MemoryKvBackend::new("meters")));
    let readings = ReadingStore::new(Arc::new(MemoryKvBackend::new("readings")));
    let meter = Meter::new("m1", "api_call", AggregationKind::Max, "$.bytes");
    registry.register(&meter).await.unwrap();

    let h = Harness::start_with(registry, readings, MemoryChannel::new(), fast()).await;
    eventually(|| async { h.channel.live_subscriptions(&meter.hash()) == 1 }).await;
    assert_eq!(h.registry.list().await.unwrap().len(), 1);

    for (id, bytes) in [("e1", 4), ("e2", 11), ("e3", 7)] {
        h.service.publish_event(call(id, bytes)).await.unwrap();
    }
    wait_for_count(&h.service, "api_call.max.m1.cust-1", 3).await;
    assert_eq!(h.reading("api_call.max.m1.cust-1").await.max, 11.0);

    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_keeps_durables() {
    let h = Harness::start(fast()).await;
    let meter = Meter::new("m1", "api_call", AggregationKind::Count, "$.bytes");
    h.add(&meter).await;

    let channel = h.channel.clone();
    h.stop().await;

    assert_eq!(channel.live_subscriptions(&meter.hash()), 0);
    assert_eq!(channel.durables(), vec![meter.hash()]);
}
