//! # backend：注册中心后端契约
//!
//! ## 定位（Why）
//! - 协调存储（带租约与前缀监听的键值库）与集群编排器（Endpoints 对象）都被视为外部协作者，
//!   本模块只约定注册会话与发现监听需要的最小原语；
//! - 一致性协议与编排器 API 细节不在本 crate 范围内，具体客户端通过实现下列 trait 接入。
//!
//! ## 契约（What）
//! - [`CoordinationStore`]：`grant` / `keep_alive_once` / `revoke` / `put` / `delete` /
//!   `list_prefix` / `watch_prefix`；
//! - [`EndpointsApi`]：按名称监听与列举 Endpoints；
//! - 实现必须可并发调用（`Send + Sync`），同一客户端可被多个会话与监听器只读共享；
//! - 所有往返都由调用方通过 [`call_with_timeout`] 套上统一超时。
//!
//! ## 内存实现（How）
//! - [`memory`] 子模块提供 `InMemoryStore` 与 `InMemoryEndpoints`，带租约过期与故障注入，
//!   供测试与本地开发使用。
//! - feature `etcd` 启用 `etcd::EtcdStore`（`etcd-client`），feature `kubernetes` 启用
//!   `kubernetes::KubeEndpoints`（`kube` + `k8s-openapi`）。

use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BackendError;

pub mod endpoints;
#[cfg(feature = "etcd")]
pub mod etcd;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;
pub mod memory;

pub use endpoints::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints, EndpointsApi};
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
#[cfg(feature = "kubernetes")]
pub use kubernetes::KubeEndpoints;

/// 协调存储分配的租约标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// 前缀列举返回的一条记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// 前缀监听产生的变更类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// 前缀监听的单条通知；发现层只把它当作“需要重新列举”的信号。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
}

/// 前缀监听流；流结束表示后端关闭了这次订阅。
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// 协调存储契约。
///
/// # 教案式说明
/// - **意图 (Why)**：注册会话依赖“租约 + 绑定租约的键值”实现存活判定，发现监听依赖“前缀列举 + 前缀监听”
///   获得全量成员；
/// - **契约 (What)**：
///   - `grant(ttl)` 返回新租约，`ttl` 以秒为粒度，不足 1 秒按 1 秒处理；
///   - `keep_alive_once` 续约一次并返回剩余 TTL，租约不存在时返回 [`BackendError::LeaseNotFound`]；
///   - `put` 可绑定租约，租约过期后键被自动删除；
///   - `list_prefix` 返回按键排序的全部记录；`watch_prefix` 返回后续变更通知；
/// - **风险 (Trade-offs)**：监听流只承诺“发生过变更”，不承诺逐条事件完整，发现层因此每次都全量重列。
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, BackendError>;

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration, BackendError>;

    async fn revoke(&self, lease: LeaseId) -> Result<(), BackendError>;

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, BackendError>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, BackendError>;
}

/// 为单次后端往返套上统一超时。
///
/// 超时映射为 [`BackendError::Timeout`]，`op` 用于日志与错误定位。
pub async fn call_with_timeout<T, F>(
    op: &'static str,
    after: Duration,
    call: F,
) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout { op, after }),
    }
}
