//! 集群编排器 Endpoints 契约。
//!
//! 只保留发现需要的字段：每个子集（subset）的地址列表与端口列表；端口可具名。

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BackendError;

/// 子集中的一个就绪地址。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    pub ip: String,
}

/// 子集暴露的端口；`name` 为空表示匿名端口。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointPort {
    pub name: Option<String>,
    pub port: u16,
}

/// 一组共享相同端口集合的地址。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
}

impl EndpointSubset {
    /// 按名称解析端口；未命中具名端口时原样返回 `token`，由调用方当作字面端口号。
    pub fn resolve_port(&self, token: &str) -> String {
        self.ports
            .iter()
            .find(|port| port.name.as_deref() == Some(token))
            .map(|port| port.port.to_string())
            .unwrap_or_else(|| token.to_owned())
    }
}

/// 按服务名选中的 Endpoints 对象。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub name: String,
    pub subsets: Vec<EndpointSubset>,
}

/// 监听到的 Endpoints 变更信号；内容不携带数据，消费者需重新列举。
pub type EndpointsWatch = BoxStream<'static, ()>;

/// 集群编排器的 Endpoints 读取契约。
///
/// - **契约 (What)**：`watch` 订阅命名空间内名为 `name` 的 Endpoints 对象的变更（包括重复或瞬时事件）；
///   `list` 返回当前全部匹配对象；
/// - **前置条件**：实现者已完成鉴权与客户端初始化。
#[async_trait]
pub trait EndpointsApi: Send + Sync + 'static {
    async fn watch(&self, namespace: &str, name: &str) -> Result<EndpointsWatch, BackendError>;

    async fn list(&self, namespace: &str, name: &str) -> Result<Vec<Endpoints>, BackendError>;
}
