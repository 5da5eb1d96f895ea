//! 协调存储后端的服务发现（scheme `etcd`）。
//!
//! 目标语法为 `<namespace>.<service>`，监听前缀 `/<prefix>/<namespace>.<service>/` 下的全部注册记录。
//! 无法解码的记录以 WARN 记录后跳过，不影响同一快照中的其他实例。

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::warn;

use super::{ChangeStream, Discovery, DiscoverySettings, SnapshotSource, SnapshotWatch, start_watch};
use crate::{
    backend::CoordinationStore,
    error::{BackendError, RegistryError},
    instance::{Snapshot, decode_instance, service_key, service_prefix},
};

/// 基于 [`CoordinationStore`] 的发现实现。
#[derive(Clone)]
pub struct StoreDiscovery {
    store: Arc<dyn CoordinationStore>,
    settings: DiscoverySettings,
}

impl StoreDiscovery {
    pub const SCHEME: &'static str = "etcd";

    pub fn new(store: Arc<dyn CoordinationStore>, settings: DiscoverySettings) -> Self {
        Self { store, settings }
    }

    /// 目标对应的监听前缀。
    pub fn watch_prefix(&self, target: &str) -> Result<String, RegistryError> {
        validate_target(target)?;
        Ok(service_prefix(self.settings.prefix(), target))
    }
}

fn validate_target(target: &str) -> Result<(), RegistryError> {
    let invalid = |reason| RegistryError::InvalidTarget {
        target: target.to_owned(),
        reason,
    };
    if target.contains('/') {
        return Err(invalid("must not contain `/`"));
    }
    match target.split_once('.') {
        Some((namespace, service)) if !namespace.is_empty() && !service.is_empty() => Ok(()),
        _ => Err(invalid("expected `<namespace>.<service>`")),
    }
}

#[async_trait]
impl Discovery for StoreDiscovery {
    fn scheme(&self) -> &'static str {
        Self::SCHEME
    }

    fn format_target(&self, namespace: &str, endpoint: &str) -> String {
        service_key(namespace, endpoint)
    }

    async fn discover(&self, target: &str) -> Result<SnapshotWatch, RegistryError> {
        let prefix = self.watch_prefix(target)?;
        let source = PrefixSource {
            store: Arc::clone(&self.store),
            prefix,
        };
        start_watch(source, target.to_owned(), self.settings.clone()).await
    }
}

struct PrefixSource {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

#[async_trait]
impl SnapshotSource for PrefixSource {
    async fn subscribe(&self) -> Result<ChangeStream, BackendError> {
        let events = self.store.watch_prefix(&self.prefix).await?;
        Ok(events.map(|_| ()).boxed())
    }

    async fn list(&self) -> Result<Snapshot, BackendError> {
        let records = self.store.list_prefix(&self.prefix).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| match decode_instance(&record.value) {
                Ok(instance) => Some(instance),
                Err(err) => {
                    warn!(key = %record.key, error = %err, "skipping undecodable registry record");
                    None
                }
            })
            .collect())
    }
}
