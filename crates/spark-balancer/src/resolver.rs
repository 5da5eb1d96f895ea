//! # 解析桥接
//!
//! ## 核心意图（Why）
//! - 把 `scheme://namespace/endpoint` 拨号地址接到对应发现后端的快照流上，并把每份快照整体交给
//!   [`ClientConn::update_addresses`]；
//! - 同一目标只维持一个监听：后续拨号复用正在运行的监听并立即拿到最新快照，最后一个句柄释放时监听关闭。
//!
//! ## 执行流程（How）
//! 1. 解析拨号地址，按 scheme 在 [`ResolverRegistry`] 中找到发现实现，并用它的 `format_target` 得到发现目标；
//! 2. 在 `DashMap` 缓存中按 `(scheme, 发现目标)` 查找共享监听，没有则 `discover` 并启动扇出任务；
//! 3. 连接挂到扇出表上：已有快照则当场应用，否则最多等待 `resolve_timeout` 直到首个快照应用完毕；
//! 4. 超时只记录 WARN 并照常返回，扇出任务会继续应用后续快照。
//!
//! ## 契约（What）
//! - [`ResolverHandle::resolve_now`] 为空操作，快照推送完全由监听驱动；
//! - [`ResolverHandle::close`] 幂等；最后一个引用关闭时等待监听任务与扇出任务退出；
//! - 丢弃句柄只释放引用并发出关闭信号，不等待。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use spark_registry::{
    Discovery, Lifecycle, RegistryConfig, RegistryError, Snapshot, SnapshotStream, WatchHandle,
    config::DEFAULT_RESOLVE_TIMEOUT,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    conn::{Address, ClientConn},
    error::BalancerError,
    target::DialTarget,
};

/// 显式构造的 `scheme → 发现实现` 注册表。
#[derive(Default)]
pub struct ResolverRegistry {
    discoveries: DashMap<String, Arc<dyn Discovery>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以实现自身的 scheme 注册，返回被替换的旧实现。
    pub fn register(&self, discovery: Arc<dyn Discovery>) -> Option<Arc<dyn Discovery>> {
        let scheme = discovery.scheme().to_owned();
        info!(%scheme, "discovery registered");
        self.discoveries.insert(scheme, discovery)
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Discovery>> {
        self.discoveries
            .get(scheme)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 已注册的 scheme，按字典序排列。
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .discoveries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        schemes.sort();
        schemes
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct WatchKey {
    scheme: String,
    target: String,
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.target)
    }
}

#[derive(Default)]
struct FanoutState {
    conns: Vec<(u64, Arc<dyn ClientConn>)>,
    latest: Option<Vec<Address>>,
}

/// 把快照扇出给挂在同一监听上的全部连接。
struct Fanout {
    state: Mutex<FanoutState>,
    applied: watch::Sender<u64>,
}

/// 挂载结果：已有快照则当场应用，否则返回等待首个应用的接收端与挂载时的代数。
enum Attached {
    Applied,
    Pending(watch::Receiver<u64>, u64),
}

impl Fanout {
    fn new() -> Self {
        let (applied, _) = watch::channel(0);
        Self {
            state: Mutex::new(FanoutState::default()),
            applied,
        }
    }

    fn attach(&self, id: u64, conn: Arc<dyn ClientConn>) -> Attached {
        let mut state = self.state.lock();
        let attached = match &state.latest {
            Some(addresses) => {
                conn.update_addresses(addresses.clone());
                Attached::Applied
            }
            None => {
                let rx = self.applied.subscribe();
                let seen = *rx.borrow();
                Attached::Pending(rx, seen)
            }
        };
        state.conns.push((id, conn));
        attached
    }

    fn detach(&self, id: u64) {
        self.state.lock().conns.retain(|(conn_id, _)| *conn_id != id);
    }

    fn apply(&self, snapshot: Snapshot) {
        let addresses: Vec<Address> = snapshot.into_iter().map(Address::from).collect();
        let mut state = self.state.lock();
        for (_, conn) in &state.conns {
            conn.update_addresses(addresses.clone());
        }
        state.latest = Some(addresses);
        self.applied.send_modify(|generation| *generation += 1);
    }
}

/// 一个目标上的共享监听：发现任务加扇出任务。
struct SharedWatch {
    key: WatchKey,
    fanout: Arc<Fanout>,
    handle: WatchHandle,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SharedWatch {
    fn spawn(key: WatchKey, stream: SnapshotStream, handle: WatchHandle) -> Arc<Self> {
        let fanout = Arc::new(Fanout::new());
        let pump = tokio::spawn(pump(Arc::clone(&fanout), stream, key.to_string()));
        Arc::new(Self {
            key,
            fanout,
            handle,
            pump: tokio::sync::Mutex::new(Some(pump)),
        })
    }

    fn shutdown(&self) {
        self.handle.shutdown();
    }

    async fn close(&self) {
        self.handle.close().await;
        let mut pump = self.pump.lock().await;
        if let Some(task) = pump.take() {
            if let Err(err) = task.await {
                warn!(target_key = %self.key, error = %err, "resolver pump aborted");
            }
        }
    }
}

async fn pump(fanout: Arc<Fanout>, mut stream: SnapshotStream, key: String) {
    while let Some(snapshot) = stream.next().await {
        debug!(target_key = %key, instances = snapshot.len(), "applying snapshot");
        fanout.apply(snapshot);
    }
    debug!(target_key = %key, "resolver pump finished");
}

struct CachedWatch {
    refs: usize,
    shared: Arc<SharedWatch>,
}

struct BridgeInner {
    registry: Arc<ResolverRegistry>,
    resolve_timeout: Duration,
    watches: DashMap<WatchKey, CachedWatch>,
    next_conn: AtomicU64,
}

impl BridgeInner {
    async fn acquire(
        &self,
        key: &WatchKey,
        discovery: &dyn Discovery,
    ) -> Result<Arc<SharedWatch>, BalancerError> {
        if let Some(mut cached) = self.watches.get_mut(key) {
            cached.refs += 1;
            return Ok(Arc::clone(&cached.shared));
        }

        let (stream, handle) = discovery.discover(&key.target).await?.into_parts();
        let fresh = SharedWatch::spawn(key.clone(), stream, handle);

        match self.watches.entry(key.clone()) {
            Entry::Occupied(mut cached) => {
                // 并发构建抢先写入了缓存，放弃自己的监听。
                fresh.shutdown();
                cached.get_mut().refs += 1;
                Ok(Arc::clone(&cached.get().shared))
            }
            Entry::Vacant(slot) => {
                info!(target_key = %key, "resolver watch started");
                slot.insert(CachedWatch {
                    refs: 1,
                    shared: Arc::clone(&fresh),
                });
                Ok(fresh)
            }
        }
    }

    /// 释放一个引用；返回值为最后一个引用释放时被移出缓存的监听。
    ///
    /// 缓存项必须仍是 `shared` 本身：`close_all` 之后同一目标可能已换成新的监听，旧句柄不得动它。
    fn release(&self, key: &WatchKey, shared: &Arc<SharedWatch>) -> Option<Arc<SharedWatch>> {
        match self.watches.entry(key.clone()) {
            Entry::Occupied(cached) if !Arc::ptr_eq(&cached.get().shared, shared) => None,
            Entry::Occupied(mut cached) => {
                let entry = cached.get_mut();
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs == 0 {
                    info!(target_key = %key, "resolver watch released");
                    Some(cached.remove().shared)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => None,
        }
    }
}

/// 拨号地址到快照流的桥接器。克隆共享同一份监听缓存。
#[derive(Clone)]
pub struct ResolverBridge {
    inner: Arc<BridgeInner>,
}

impl ResolverBridge {
    pub fn new(registry: Arc<ResolverRegistry>, resolve_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                registry,
                resolve_timeout,
                watches: DashMap::new(),
                next_conn: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(registry: Arc<ResolverRegistry>, config: &RegistryConfig) -> Self {
        Self::new(registry, config.resolve_timeout())
    }

    pub fn registry(&self) -> &Arc<ResolverRegistry> {
        &self.inner.registry
    }

    pub fn resolve_timeout(&self) -> Duration {
        self.inner.resolve_timeout
    }

    /// 当前缓存中的共享监听数量。
    pub fn active_watches(&self) -> usize {
        self.inner.watches.len()
    }

    /// 为 `conn` 构建解析器。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 拨号地址非法返回 [`BalancerError::InvalidTarget`]，scheme 未注册返回
    ///     [`BalancerError::UnknownScheme`]，发现目标非法或首次订阅失败返回 [`BalancerError::Discovery`]；
    ///   - 成功返回时，`conn` 已收到首个快照，或者已等待满 `resolve_timeout`；
    /// - **风险 (Trade-offs)**：等待期间取消该 future 会随句柄一起释放引用。
    pub async fn build(
        &self,
        target: &str,
        conn: Arc<dyn ClientConn>,
    ) -> Result<ResolverHandle, BalancerError> {
        let dial = DialTarget::parse(target)?;
        let discovery =
            self.inner
                .registry
                .get(&dial.scheme)
                .ok_or_else(|| BalancerError::UnknownScheme {
                    scheme: dial.scheme.clone(),
                })?;
        let key = WatchKey {
            scheme: dial.scheme.clone(),
            target: discovery.format_target(&dial.namespace, &dial.endpoint),
        };

        let shared = self.inner.acquire(&key, discovery.as_ref()).await?;
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let attached = shared.fanout.attach(conn_id, conn);
        let handle = ResolverHandle {
            inner: Arc::clone(&self.inner),
            key,
            conn_id,
            shared,
            released: AtomicBool::new(false),
        };

        if let Attached::Pending(mut applied, seen) = attached {
            let first = applied.wait_for(|generation| *generation > seen);
            if tokio::time::timeout(self.inner.resolve_timeout, first)
                .await
                .is_err()
            {
                warn!(
                    dial_target = %dial,
                    timeout = ?self.inner.resolve_timeout,
                    "initial resolution timed out, continuing in background"
                );
            }
        }
        Ok(handle)
    }

    /// 关闭缓存中的全部监听；仍存活的句柄随后释放时为空操作。
    pub async fn close_all(&self) {
        let keys: Vec<WatchKey> = self
            .inner
            .watches
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, cached)) = self.inner.watches.remove(&key) {
                cached.shared.close().await;
            }
        }
    }
}

impl Default for ResolverBridge {
    fn default() -> Self {
        Self::new(Arc::new(ResolverRegistry::new()), DEFAULT_RESOLVE_TIMEOUT)
    }
}

impl fmt::Debug for ResolverBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverBridge")
            .field("registry", &self.inner.registry)
            .field("resolve_timeout", &self.inner.resolve_timeout)
            .field("active_watches", &self.inner.watches.len())
            .finish()
    }
}

#[async_trait]
impl Lifecycle for ResolverBridge {
    fn name(&self) -> &str {
        "resolver-bridge"
    }

    async fn init(&self) -> Result<(), RegistryError> {
        info!(schemes = ?self.inner.registry.schemes(), "resolver bridge ready");
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.close_all().await;
        Ok(())
    }
}

/// 返回给运行时的解析器。
pub struct ResolverHandle {
    inner: Arc<BridgeInner>,
    key: WatchKey,
    conn_id: u64,
    shared: Arc<SharedWatch>,
    released: AtomicBool,
}

impl ResolverHandle {
    /// 空操作：快照由监听推送。
    pub fn resolve_now(&self) {}

    /// 后端视角的发现目标，例如 `prod.orders`。
    pub fn target(&self) -> &str {
        &self.key.target
    }

    pub fn scheme(&self) -> &str {
        &self.key.scheme
    }

    /// 释放引用；若是最后一个引用，等待监听完全退出。
    pub async fn close(&self) {
        if let Some(last) = self.release() {
            last.close().await;
        }
    }

    fn release(&self) -> Option<Arc<SharedWatch>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.shared.fanout.detach(self.conn_id);
        self.inner.release(&self.key, &self.shared)
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        if let Some(last) = self.release() {
            last.shutdown();
        }
    }
}

impl fmt::Debug for ResolverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverHandle")
            .field("key", &self.key)
            .field("conn_id", &self.conn_id)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::AddressBalancer;
    use spark_registry::{
        CoordinationStore, DiscoverySettings, StoreDiscovery, backend::memory::InMemoryStore,
    };
    use tracing_test::traced_test;

    fn bridge(store: &InMemoryStore, timeout: Duration) -> ResolverBridge {
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(StoreDiscovery::new(
            Arc::new(store.clone()),
            DiscoverySettings::new(),
        )));
        ResolverBridge::new(registry, timeout)
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn first_snapshot_timeout_is_logged_and_not_fatal() {
        let store = InMemoryStore::new();
        let bridge = bridge(&store, Duration::from_secs(60));
        // 首次列举失败，首个快照要等到下一次变更事件。
        store.fail_next(spark_registry::backend::memory::StoreOp::List, 1);

        let conn = AddressBalancer::new();
        let handle = bridge.build("etcd://prod/orders", conn.clone()).await.unwrap();
        assert!(logs_contain("initial resolution timed out"));
        assert!(conn.addresses().is_empty());

        store
            .put(
                "/registry.etcd/prod.orders/a",
                br#"{"address":"10.0.0.1:1"}"#.to_vec(),
                None,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(conn.addresses(), vec![Address::new("10.0.0.1:1")]);

        handle.close().await;
    }

    #[tokio::test]
    async fn unknown_scheme_and_bad_target_fail_fast() {
        let bridge = bridge(&InMemoryStore::new(), Duration::from_secs(1));
        let conn = AddressBalancer::new();

        let err = bridge.build("zk://prod/orders", conn.clone()).await.unwrap_err();
        assert!(matches!(err, BalancerError::UnknownScheme { .. }));

        let err = bridge.build("etcd:/prod/orders", conn.clone()).await.unwrap_err();
        assert!(matches!(err, BalancerError::InvalidTarget { .. }));

        let err = bridge.build("etcd:///orders", conn).await.unwrap_err();
        assert!(matches!(
            err,
            BalancerError::Discovery(RegistryError::InvalidTarget { .. })
        ));
        assert_eq!(bridge.active_watches(), 0);
    }

    #[test]
    fn registry_replaces_by_scheme() {
        let registry = ResolverRegistry::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let first = registry.register(Arc::new(StoreDiscovery::new(
            Arc::clone(&store),
            DiscoverySettings::new(),
        )));
        assert!(first.is_none());
        let second =
            registry.register(Arc::new(StoreDiscovery::new(store, DiscoverySettings::new())));
        assert!(second.is_some());
        assert_eq!(registry.schemes(), vec!["etcd".to_owned()]);
    }
}
