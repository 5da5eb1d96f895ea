//! 基于 `etcd-client` 的协调存储实现（feature `etcd`）。
//!
//! # 教案式说明
//! - **意图 (Why)**：生产环境的注册与发现直接落在 etcd 的租约与前缀监听上；
//! - **逻辑 (How)**：`etcd_client::Client` 可廉价克隆，每次调用克隆一份以获得 `&mut`；
//!   `keep_alive_once` 打开一次续约流、发送一次请求并读取一条应答；
//!   前缀监听把 `Watcher` 与应答流一起搬进流状态，流被丢弃时监听随之取消；
//! - **契约 (What)**：
//!   - 续约应答 TTL 为 0 或缺失、以及服务端报告 “lease not found” 时返回
//!     [`BackendError::LeaseNotFound`]，其余失败一律映射为 [`BackendError::Unavailable`]；
//!   - 监听应答报错或被服务端取消时流结束，由发现层按退避重新订阅。

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Error as EtcdError, EventType, GetOptions, PutOptions, WatchOptions};
use futures::{StreamExt, stream};

use super::{CoordinationStore, KeyValue, LeaseId, WatchEvent, WatchEventKind, WatchStream};
use crate::{error::BackendError, instance::lease_ttl};

/// etcd 集群上的 [`CoordinationStore`]。
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// 连接到给定的 etcd 端点列表。
    pub async fn connect<E: AsRef<str>>(endpoints: &[E]) -> Result<Self, BackendError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|err| unavailable("connect", err))?;
        Ok(Self { client })
    }

    /// 复用宿主已建立的客户端。
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, BackendError> {
        let mut client = self.client.clone();
        let granted = client
            .lease_grant(grant_ttl_secs(ttl), None)
            .await
            .map_err(|err| unavailable("grant", err))?;
        Ok(LeaseId(granted.id()))
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration, BackendError> {
        let mut client = self.client.clone();
        let (mut keeper, mut replies) = client
            .lease_keep_alive(lease.0)
            .await
            .map_err(|err| lease_error("keep_alive", lease, err))?;
        keeper
            .keep_alive()
            .await
            .map_err(|err| lease_error("keep_alive", lease, err))?;
        let reply = replies
            .message()
            .await
            .map_err(|err| lease_error("keep_alive", lease, err))?;
        remaining_ttl(lease, reply.map(|reply| reply.ttl()))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), BackendError> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease.0)
            .await
            .map_err(|err| lease_error("revoke", lease, err))?;
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), BackendError> {
        let mut client = self.client.clone();
        let options = lease.map(|lease| PutOptions::new().with_lease(lease.0));
        client
            .put(key, value, options)
            .await
            .map_err(|err| match lease {
                Some(lease) => lease_error("put", lease, err),
                None => unavailable("put", err),
            })?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .map_err(|err| unavailable("delete", err))?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, BackendError> {
        let mut client = self.client.clone();
        let listed = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|err| unavailable("list", err))?;
        Ok(listed
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, BackendError> {
        let mut client = self.client.clone();
        let (watcher, replies) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|err| unavailable("watch", err))?;

        let events = stream::unfold((watcher, replies), |(watcher, mut replies)| async move {
            match replies.message().await {
                Ok(Some(reply)) if !reply.canceled() => {
                    let events: Vec<WatchEvent> = reply
                        .events()
                        .iter()
                        .filter_map(|event| {
                            event.kv().map(|kv| WatchEvent {
                                kind: watch_kind(event.event_type()),
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                            })
                        })
                        .collect();
                    Some((stream::iter(events), (watcher, replies)))
                }
                _ => None,
            }
        });
        Ok(events.flatten().boxed())
    }
}

/// etcd 租约以秒为单位，与注册参数的取整规则一致。
fn grant_ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(lease_ttl(ttl).as_secs()).unwrap_or(i64::MAX)
}

fn remaining_ttl(lease: LeaseId, ttl: Option<i64>) -> Result<Duration, BackendError> {
    match ttl {
        Some(secs) if secs > 0 => Ok(Duration::from_secs(secs.unsigned_abs())),
        _ => Err(BackendError::LeaseNotFound { lease }),
    }
}

fn watch_kind(event_type: EventType) -> WatchEventKind {
    match event_type {
        EventType::Put => WatchEventKind::Put,
        EventType::Delete => WatchEventKind::Delete,
    }
}

fn unavailable(op: &str, err: EtcdError) -> BackendError {
    BackendError::unavailable(format!("etcd {op}: {err}"))
}

fn lease_error(op: &str, lease: LeaseId, err: EtcdError) -> BackendError {
    if err.to_string().contains("lease not found") {
        BackendError::LeaseNotFound { lease }
    } else {
        unavailable(op, err)
    }
}
