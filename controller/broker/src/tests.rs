use super::*;
use maplit::btreemap;
use meshplane_controller_core::{
    event::{Kind, Payload, PodMeta},
    mesh_config::MeshConfig,
};
use tokio::time;

fn mk_broker(config: BrokerConfig) -> (Broker, drain::Signal, drain::Watch) {
    let (signal, watch) = drain::channel();
    let broker = Broker::new(config, BrokerMetrics::default(), watch.clone());
    (broker, signal, watch)
}

fn object(name: &str) -> Payload {
    Payload::object(Some("ns".to_string()), name)
}

fn mesh_config(resync: Duration) -> Payload {
    let mut config = MeshConfig::default();
    config.sidecar.config_resync_interval = resync.into();
    Payload::MeshConfig(Arc::new(config))
}

async fn next<T>(sub: &mut Subscription<T>) -> T {
    time::timeout(Duration::from_secs(60), sub.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription must not be closed")
}

#[tokio::test(start_paused = true)]
async fn broadcasts_reach_every_proxy() {
    let (broker, _signal, _watch) = mk_broker(BrokerConfig::default());
    let mut a = broker.subscribe_proxy_updates(&Uuid::new_v4());
    let mut b = broker.subscribe_proxy_updates(&Uuid::new_v4());

    broker
        .enqueue(PubSubMessage::added(Kind::Endpoint, object("ep")))
        .await;

    assert_eq!(next(&mut a).await.trigger, Kind::Endpoint.added());
    assert_eq!(next(&mut b).await.trigger, Kind::Endpoint.added());
    assert_eq!(broker.metrics().total_broadcasts(), 1);
}

#[tokio::test(start_paused = true)]
async fn broadcasts_are_coalesced_within_window() {
    let (broker, _signal, _watch) = mk_broker(BrokerConfig::default());
    let mut sub = broker.subscribe_proxy_updates(&Uuid::new_v4());

    for i in 0..10 {
        broker
            .enqueue(PubSubMessage::added(Kind::Service, object(&format!("svc-{i}"))))
            .await;
    }
    broker.broadcast_proxy_update().await;

    let update = next(&mut sub).await;
    assert_eq!(update.trigger, EventKind::PROXY_UPDATE);

    time::sleep(Duration::from_secs(5)).await;
    assert!(sub.try_recv().is_err(), "only one broadcast expected");
    assert_eq!(broker.metrics().total_proxy_update_events(), 11);
    assert_eq!(broker.metrics().total_broadcasts(), 1);
}

#[tokio::test(start_paused = true)]
async fn broadcasts_are_not_held_past_max_window() {
    let (broker, _signal, _watch) = mk_broker(BrokerConfig::default());
    let mut sub = broker.subscribe_proxy_updates(&Uuid::new_v4());

    // Events keep arriving inside the sliding window, so only the max window
    // forces a publish.
    for _ in 0..10 {
        broker.broadcast_proxy_update().await;
        time::sleep(Duration::from_millis(950)).await;
    }
    assert_eq!(broker.metrics().total_broadcasts(), 0);

    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.metrics().total_broadcasts(), 1);
    next(&mut sub).await;
}

#[tokio::test(start_paused = true)]
async fn pod_updates_target_one_proxy() {
    let (broker, _signal, _watch) = mk_broker(BrokerConfig::default());
    let (uuid_a, uuid_b) = (Uuid::new_v4(), Uuid::new_v4());
    let mut a = broker.subscribe_proxy_updates(&uuid_a);
    let mut b = broker.subscribe_proxy_updates(&uuid_b);

    let pod = Payload::Pod(Arc::new(PodMeta {
        namespace: "ns".to_string(),
        name: "pod-a".to_string(),
        labels: btreemap! { PROXY_UUID_LABEL.to_string() => uuid_a.to_string() },
        ..Default::default()
    }));
    broker
        .enqueue(PubSubMessage::updated(Kind::Pod, pod.clone(), pod))
        .await;

    assert_eq!(next(&mut a).await.trigger, Kind::Pod.updated());
    time::sleep(Duration::from_secs(15)).await;
    assert!(b.try_recv().is_err(), "other proxies must not be updated");
    assert_eq!(broker.metrics().total_broadcasts(), 0);
    assert_eq!(broker.metrics().total_dispatched_proxy_updates(), 1);
}

#[tokio::test(start_paused = true)]
async fn every_event_is_published_by_kind() {
    let (broker, _signal, _watch) = mk_broker(BrokerConfig::default());
    let mut namespaces = broker.subscribe_kube_events([Kind::Namespace.added()]);
    let mut services = broker.subscribe_kube_events([Kind::Service.deleted()]);

    let added = PubSubMessage::added(Kind::Namespace, object("ns-1"));
    broker.enqueue(added.clone()).await;
    let deleted = PubSubMessage::deleted(Kind::Service, object("svc"));
    broker.enqueue(deleted.clone()).await;

    assert_eq!(next(&mut namespaces).await, added);
    assert_eq!(next(&mut services).await, deleted);
    assert!(namespaces.try_recv().is_err());

    broker.unsubscribe_kube_events(&mut namespaces).await;
    broker.unsubscribe_kube_events(&mut services).await;
    assert!(namespaces.is_closed());
}

#[tokio::test(start_paused = true)]
async fn malformed_events_do_not_stall_dispatch() {
    let (broker, _signal, _watch) = mk_broker(BrokerConfig::default());
    let mut sub = broker.subscribe_proxy_updates(&Uuid::new_v4());

    broker
        .enqueue(PubSubMessage::updated(
            Kind::MeshConfig,
            object("a"),
            object("b"),
        ))
        .await;
    broker
        .enqueue(PubSubMessage::added(Kind::Ingress, object("ing")))
        .await;

    assert_eq!(next(&mut sub).await.trigger, Kind::Ingress.added());
    assert_eq!(broker.metrics().total_proxy_update_events(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_events_are_retried_when_full() {
    let config = BrokerConfig {
        queue_capacity: 1,
        qps: 1.0,
        burst: 1,
        ..Default::default()
    };
    let (broker, _signal, _watch) = mk_broker(config);
    let mut services = broker.subscribe_kube_events([Kind::Service.added()]);

    for i in 0..4 {
        broker.add_rate_limited(PubSubMessage::added(Kind::Service, object(&format!("{i}"))));
    }
    assert_eq!(broker.metrics().backlog_depth(), 3);

    let mut names = Vec::new();
    for _ in 0..4 {
        match next(&mut services).await.new {
            Some(Payload::Object(o)) => names.push(o.name),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    assert_eq!(names, ["0", "1", "2", "3"], "backlogged events keep their order");
    assert!(broker.metrics().queue_retries.get() >= 1);
    assert_eq!(broker.metrics().backlog_depth(), 0);
    assert_eq!(broker.metrics().total_dropped_events(), 0);
}

#[tokio::test(start_paused = true)]
async fn backlog_is_bounded() {
    let config = BrokerConfig {
        queue_capacity: 1,
        backlog_capacity: 4,
        qps: 1.0,
        burst: 1,
        ..Default::default()
    };
    let (broker, _signal, _watch) = mk_broker(config);
    let mut events =
        broker.subscribe_kube_events([Kind::Service.added(), EventKind::PROXY_UPDATE]);

    let svc = |i: usize| PubSubMessage::added(Kind::Service, object(&format!("{i}")));
    for i in 0..20 {
        broker.add_rate_limited(svc(i));
    }
    assert_eq!(broker.metrics().backlog_depth(), 4);
    assert_eq!(broker.metrics().total_dropped_events(), 15);

    // Backlogged events are not held twice.
    broker.add_rate_limited(svc(1));
    assert_eq!(broker.metrics().backlog_depth(), 4);
    assert_eq!(broker.metrics().total_dropped_events(), 15);

    let mut names = Vec::new();
    for _ in 0..5 {
        match next(&mut events).await.new {
            Some(Payload::Object(o)) => names.push(o.name),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    assert_eq!(names, ["0", "1", "2", "3", "4"]);

    // The dropped events are replaced by a single resync.
    assert_eq!(next(&mut events).await.kind, EventKind::PROXY_UPDATE);
    time::sleep(Duration::from_secs(10)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(broker.metrics().backlog_depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn dispatch_stops_on_shutdown() {
    let (broker, signal, watch) = mk_broker(BrokerConfig::default());
    drop(watch);
    time::timeout(Duration::from_secs(1), signal.drain())
        .await
        .expect("dispatcher tasks must release shutdown");

    let mut sub = broker.subscribe_kube_events([Kind::Service.added()]);
    broker.add_rate_limited(PubSubMessage::added(Kind::Service, object("svc")));
    time::sleep(Duration::from_secs(5)).await;
    assert!(sub.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn resync_ticker_follows_mesh_config() {
    let config = BrokerConfig {
        broadcast_window: Duration::ZERO,
        ..Default::default()
    };
    let (broker, _signal, watch) = mk_broker(config);
    tokio::spawn(ResyncTicker::new(broker.clone(), Duration::from_secs(30)).run(watch));
    tokio::task::yield_now().await;
    let mut sub = broker.subscribe_proxy_updates(&Uuid::new_v4());

    // Changing only the resync interval does not by itself update proxies.
    broker
        .enqueue(PubSubMessage::updated(
            Kind::MeshConfig,
            mesh_config(Duration::ZERO),
            mesh_config(Duration::from_secs(60)),
        ))
        .await;
    time::sleep(Duration::from_secs(59)).await;
    assert!(sub.try_recv().is_err());
    assert_eq!(broker.metrics().total_resync_ticks(), 0);

    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(next(&mut sub).await.trigger, EventKind::PROXY_UPDATE);
    assert_eq!(broker.metrics().total_resync_ticks(), 1);

    // Zero stops the ticker.
    broker
        .enqueue(PubSubMessage::updated(
            Kind::MeshConfig,
            mesh_config(Duration::from_secs(60)),
            mesh_config(Duration::ZERO),
        ))
        .await;
    time::sleep(Duration::from_secs(300)).await;
    assert_eq!(broker.metrics().total_resync_ticks(), 1);

    // Intervals below the minimum are rejected.
    broker
        .enqueue(PubSubMessage::updated(
            Kind::MeshConfig,
            mesh_config(Duration::ZERO),
            mesh_config(Duration::from_secs(10)),
        ))
        .await;
    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(broker.metrics().total_invalid_resync_intervals(), 1);
    assert_eq!(broker.metrics().total_resync_ticks(), 1);
}
