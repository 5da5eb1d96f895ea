//! 进程内后端实现，集中提供可注入故障的协调存储与 Endpoints 桩。
//!
//! # 设计定位（Why）
//! - 注册会话与发现监听的单元测试需要一个具备“租约过期、前缀监听”语义的后端，但不应依赖外部集群；
//! - 故障注入（按操作失败 N 次、整体不可用、断开监听）让续约失败、重新注册、重列失败等路径可以被确定性地覆盖。
//!
//! # 使用方式（How）
//! - 租约到期基于 `tokio::time::Instant`，在 `#[tokio::test(start_paused = true)]` 下可配合
//!   `tokio::time::advance` 精确推进；
//! - 过期租约在每次调用时惰性回收，回收会对绑定的键发出删除通知。
//!
//! # 契约说明（What）
//! - **前置条件**：只用于测试或本地开发；
//! - **后置条件**：行为与 [`CoordinationStore`]、[`EndpointsApi`] 契约一致，包括“租约过期 → 键消失”。

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, channel::mpsc};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    CoordinationStore, KeyValue, LeaseId, WatchEvent, WatchEventKind, WatchStream,
    endpoints::{Endpoints, EndpointsApi, EndpointsWatch},
};
use crate::{error::BackendError, instance::lease_ttl};

/// 可注入故障的协调存储操作。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Grant,
    KeepAlive,
    Revoke,
    Put,
    Delete,
    List,
    Watch,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug)]
struct Record {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct PrefixWatcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_lease: i64,
    leases: HashMap<LeaseId, LeaseEntry>,
    records: BTreeMap<String, Record>,
    watchers: Vec<PrefixWatcher>,
    faults: HashMap<StoreOp, usize>,
    calls: HashMap<StoreOp, usize>,
    unavailable: bool,
}

impl StoreState {
    fn begin(&mut self, op: StoreOp) -> Result<(), BackendError> {
        self.reap_expired();
        *self.calls.entry(op).or_default() += 1;
        if self.unavailable {
            return Err(BackendError::unavailable("store is offline"));
        }
        if let Some(remaining) = self.faults.get_mut(&op).filter(|left| **left > 0) {
            *remaining -= 1;
            return Err(BackendError::unavailable(format!(
                "injected failure on {op:?}"
            )));
        }
        Ok(())
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            self.drop_lease(lease);
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) {
        self.leases.remove(&lease);
        let bound: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        for key in bound {
            self.records.remove(&key);
            self.notify(WatchEventKind::Delete, &key);
        }
    }

    fn notify(&mut self, kind: WatchEventKind, key: &str) {
        self.watchers.retain(|watcher| {
            if !key.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .unbounded_send(WatchEvent {
                    kind,
                    key: key.to_owned(),
                })
                .is_ok()
        });
    }
}

/// 进程内协调存储。克隆共享同一份状态。
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来 `times` 次 `op` 调用失败。
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        *self.state.lock().faults.entry(op).or_default() += times;
    }

    /// 整体上线/下线；下线期间所有调用返回 `Unavailable`。
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// 断开全部前缀监听，监听流随之结束。
    pub fn disconnect_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    /// `op` 被调用的次数（包括失败的调用）。
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// 读取键的当前值；租约过期的键视为不存在。
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.reap_expired();
        state.records.get(key).map(|record| record.value.clone())
    }

    /// 键当前绑定的租约。
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.state.lock();
        state.reap_expired();
        state.records.get(key).and_then(|record| record.lease)
    }

    /// 租约是否仍然有效。
    pub fn lease_alive(&self, lease: LeaseId) -> bool {
        let mut state = self.state.lock();
        state.reap_expired();
        state.leases.contains_key(&lease)
    }

    /// 当前有效租约数量。
    pub fn active_leases(&self) -> usize {
        let mut state = self.state.lock();
        state.reap_expired();
        state.leases.len()
    }

    /// 列出带指定前缀的全部键。
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let mut state = self.state.lock();
        state.reap_expired();
        state
            .records
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, BackendError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::Grant)?;
        state.next_lease += 1;
        let lease = LeaseId(state.next_lease);
        let ttl = lease_ttl(ttl);
        state.leases.insert(
            lease,
            LeaseEntry {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(lease)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration, BackendError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::KeepAlive)?;
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(BackendError::LeaseNotFound { lease })?;
        entry.expires_at = Instant::now() + entry.ttl;
        Ok(entry.ttl)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::Revoke)?;
        if !state.leases.contains_key(&lease) {
            return Err(BackendError::LeaseNotFound { lease });
        }
        state.drop_lease(lease);
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::Put)?;
        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                return Err(BackendError::LeaseNotFound { lease });
            }
        }
        state
            .records
            .insert(key.to_owned(), Record { value, lease });
        state.notify(WatchEventKind::Put, key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::Delete)?;
        if state.records.remove(key).is_some() {
            state.notify(WatchEventKind::Delete, key);
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, BackendError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::List)?;
        Ok(state
            .records
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| KeyValue {
                key: key.clone(),
                value: record.value.clone(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, BackendError> {
        let mut state = self.state.lock();
        state.begin(StoreOp::Watch)?;
        let (tx, rx) = mpsc::unbounded();
        state.watchers.push(PrefixWatcher {
            prefix: prefix.to_owned(),
            tx,
        });
        Ok(rx.boxed())
    }
}

#[derive(Debug)]
struct EndpointsWatcher {
    namespace: String,
    name: String,
    tx: mpsc::UnboundedSender<()>,
}

#[derive(Debug, Default)]
struct EndpointsState {
    objects: HashMap<(String, String), Endpoints>,
    watchers: Vec<EndpointsWatcher>,
    list_faults: usize,
    list_calls: usize,
}

impl EndpointsState {
    fn notify(&mut self, namespace: &str, name: &str) {
        self.watchers.retain(|watcher| {
            if watcher.namespace != namespace || watcher.name != name {
                return !watcher.tx.is_closed();
            }
            watcher.tx.unbounded_send(()).is_ok()
        });
    }
}

/// 进程内 Endpoints 桩：对象更新会通知同名监听者。
#[derive(Clone, Debug, Default)]
pub struct InMemoryEndpoints {
    state: Arc<Mutex<EndpointsState>>,
}

impl InMemoryEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入（覆盖）命名空间内的 Endpoints 对象并通知监听者。
    pub fn apply(&self, namespace: &str, endpoints: Endpoints) {
        let mut state = self.state.lock();
        let name = endpoints.name.clone();
        state
            .objects
            .insert((namespace.to_owned(), name.clone()), endpoints);
        state.notify(namespace, &name);
    }

    /// 删除对象并通知监听者。
    pub fn remove(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        state
            .objects
            .remove(&(namespace.to_owned(), name.to_owned()));
        state.notify(namespace, name);
    }

    /// 发出一次不伴随数据变化的事件（编排器的重复/瞬时事件）。
    pub fn touch(&self, namespace: &str, name: &str) {
        self.state.lock().notify(namespace, name);
    }

    /// 让接下来 `times` 次 `list` 调用失败。
    pub fn fail_next_lists(&self, times: usize) {
        self.state.lock().list_faults += times;
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }
}

#[async_trait]
impl EndpointsApi for InMemoryEndpoints {
    async fn watch(&self, namespace: &str, name: &str) -> Result<EndpointsWatch, BackendError> {
        let (tx, rx) = mpsc::unbounded();
        self.state.lock().watchers.push(EndpointsWatcher {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            tx,
        });
        Ok(rx.boxed())
    }

    async fn list(&self, namespace: &str, name: &str) -> Result<Vec<Endpoints>, BackendError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.list_faults > 0 {
            state.list_faults -= 1;
            return Err(BackendError::unavailable("injected list failure"));
        }
        Ok(state
            .objects
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .into_iter()
            .collect())
    }
}
