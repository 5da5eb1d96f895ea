//! 拨号地址经解析桥接到达连接的端到端行为。

use std::{sync::Arc, time::Duration};

use spark_balancer::{Address, AddressBalancer, BalancerError, PickError, ResolverBridge, ResolverRegistry};
use spark_registry::{
    CoordinationStore, DiscoverySettings, EndpointsDiscovery, Lifecycle, LifecycleRegistry,
    RegistrationOptions, RegistrationSession, SessionSettings, SessionState, StoreDiscovery,
    backend::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
        memory::{InMemoryEndpoints, InMemoryStore, StoreOp},
    },
};

fn orders_endpoints(ips: &[&str]) -> Endpoints {
    Endpoints {
        name: "orders".into(),
        subsets: vec![EndpointSubset {
            addresses: ips
                .iter()
                .map(|ip| EndpointAddress { ip: (*ip).into() })
                .collect(),
            ports: vec![EndpointPort {
                name: Some("http".into()),
                port: 8080,
            }],
        }],
    }
}

fn bridge(store: &InMemoryStore, api: &InMemoryEndpoints) -> ResolverBridge {
    let registry = Arc::new(ResolverRegistry::new());
    registry.register(Arc::new(StoreDiscovery::new(
        Arc::new(store.clone()),
        DiscoverySettings::new(),
    )));
    registry.register(Arc::new(EndpointsDiscovery::new(
        Arc::new(api.clone()),
        "default",
        DiscoverySettings::new(),
    )));
    ResolverBridge::new(registry, Duration::from_secs(5))
}

/// 轮询直到连接上的地址集合满足条件。
async fn eventually(conn: &AddressBalancer, expected: &[Address]) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while conn.addresses() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "期望 {expected:?}，实际 {:?}",
        conn.addresses()
    );
}

async fn put(store: &InMemoryStore, uid: &str, record: &str) {
    store
        .put(
            &format!("/registry.etcd/prod.orders/{uid}"),
            record.as_bytes().to_vec(),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn orchestrator_updates_replace_the_address_set() {
    let store = InMemoryStore::new();
    let api = InMemoryEndpoints::new();
    api.apply("default", orders_endpoints(&["10.0.0.7"]));
    let bridge = bridge(&store, &api);

    let conn = AddressBalancer::new();
    let handle = bridge.build("k8s:///orders:http", conn.clone()).await.unwrap();
    // 首个快照在 build 返回前已经应用。
    assert_eq!(conn.addresses(), vec![Address::new("10.0.0.7:8080")]);
    assert_eq!(handle.target(), "orders:http");
    handle.resolve_now();

    api.apply("default", orders_endpoints(&["10.0.0.8", "10.0.0.9"]));
    eventually(
        &conn,
        &[Address::new("10.0.0.8:8080"), Address::new("10.0.0.9:8080")],
    )
    .await;

    api.remove("default", "orders");
    eventually(&conn, &[]).await;
    assert_eq!(conn.pick(), Err(PickError::NoConnectionAvailable));

    handle.close().await;
    assert_eq!(bridge.active_watches(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_instances_reach_the_picker() {
    let store = InMemoryStore::new();
    let bridge = bridge(&store, &InMemoryEndpoints::new());

    let options = RegistrationOptions::builder()
        .service_name("orders")
        .namespace("prod")
        .address("10.0.0.5:9090")
        .weight(3)
        .build()
        .unwrap();
    let session =
        RegistrationSession::start(Arc::new(store.clone()), options, SessionSettings::new())
            .unwrap();
    session.wait_for_state(SessionState::Registered).await;

    let conn = AddressBalancer::new();
    let handle = bridge.build("etcd://prod/orders", conn.clone()).await.unwrap();
    let expected = Address {
        addr: "10.0.0.5:9090".into(),
        weight: Some(3),
    };
    assert_eq!(conn.addresses(), vec![expected.clone()]);
    assert_eq!(conn.pick(), Ok(expected));

    session.close().await;
    eventually(&conn, &[]).await;

    handle.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn same_target_shares_one_watch() {
    let store = InMemoryStore::new();
    put(&store, "a", r#"{"address":"10.0.0.1:1"}"#).await;
    let bridge = bridge(&store, &InMemoryEndpoints::new());

    let first = AddressBalancer::new();
    let second = AddressBalancer::new();
    let h1 = bridge.build("etcd://prod/orders", first.clone()).await.unwrap();
    let h2 = bridge.build("etcd://prod/orders", second.clone()).await.unwrap();

    assert_eq!(bridge.active_watches(), 1);
    assert_eq!(store.calls(StoreOp::Watch), 1);
    // 后加入的连接立即拿到最新快照。
    assert_eq!(second.addresses(), vec![Address::new("10.0.0.1:1")]);

    put(&store, "b", r#"{"address":"10.0.0.2:1","weight":2}"#).await;
    let both = [
        Address::new("10.0.0.1:1"),
        Address {
            addr: "10.0.0.2:1".into(),
            weight: Some(2),
        },
    ];
    eventually(&first, &both).await;
    eventually(&second, &both).await;

    h1.close().await;
    assert_eq!(bridge.active_watches(), 1);

    // 已关闭的句柄不再收到更新。
    put(&store, "c", r#"{"address":"10.0.0.3:1"}"#).await;
    let mut all = both.to_vec();
    all.push(Address::new("10.0.0.3:1"));
    eventually(&second, &all).await;
    assert_eq!(first.addresses(), both.to_vec());

    h2.close().await;
    h2.close().await;
    assert_eq!(bridge.active_watches(), 0);

    // 新的构建重新订阅。
    let h3 = bridge.build("etcd://prod/orders", AddressBalancer::new()).await.unwrap();
    assert_eq!(store.calls(StoreOp::Watch), 2);
    drop(h3);
    assert_eq!(bridge.active_watches(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn build_errors_are_synchronous() {
    let store = InMemoryStore::new();
    let bridge = bridge(&store, &InMemoryEndpoints::new());

    let err = bridge
        .build("dns://prod/orders", AddressBalancer::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::UnknownScheme { ref scheme } if scheme == "dns"));

    let err = bridge
        .build("k8s:///orders", AddressBalancer::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::Discovery(_)));

    store.fail_next(StoreOp::Watch, 1);
    let err = bridge
        .build("etcd://prod/orders", AddressBalancer::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::Discovery(_)));
    assert_eq!(bridge.active_watches(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_close_stops_every_watch() {
    let store = InMemoryStore::new();
    let api = InMemoryEndpoints::new();
    let bridge = bridge(&store, &api);
    let lifecycle = LifecycleRegistry::new();
    lifecycle.register(Arc::new(bridge.clone()));
    lifecycle.init_all().await.unwrap();
    assert_eq!(bridge.name(), "resolver-bridge");

    let conn = AddressBalancer::new();
    let etcd = bridge.build("etcd://prod/orders", conn.clone()).await.unwrap();
    let k8s = bridge.build("k8s:///orders:http", conn).await.unwrap();
    assert_eq!(bridge.active_watches(), 2);

    lifecycle.close_all().await.unwrap();
    assert_eq!(bridge.active_watches(), 0);

    // 之后释放句柄是空操作。
    etcd.close().await;
    drop(k8s);
    assert_eq!(bridge.active_watches(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_from_before_close_all_leaves_newer_watch_alone() {
    let store = InMemoryStore::new();
    let bridge = bridge(&store, &InMemoryEndpoints::new());

    let old = bridge
        .build("etcd://prod/orders", AddressBalancer::new())
        .await
        .unwrap();
    bridge.close_all().await;

    let conn = AddressBalancer::new();
    let live = bridge.build("etcd://prod/orders", conn.clone()).await.unwrap();
    assert_eq!(bridge.active_watches(), 1);

    old.close().await;
    assert_eq!(bridge.active_watches(), 1);

    put(&store, "a", r#"{"address":"10.0.0.1:1"}"#).await;
    eventually(&conn, &[Address::new("10.0.0.1:1")]).await;

    live.close().await;
    assert_eq!(bridge.active_watches(), 0);
}
