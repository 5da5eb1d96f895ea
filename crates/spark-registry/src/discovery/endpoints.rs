//! 集群编排器后端的服务发现（scheme `k8s`）。
//!
//! # 教案式说明
//! - **契约 (What)**：
//!   - 目标语法 `<service>:<port>`，恰好一个 `:` 且两侧非空；`port` 可以是具名端口或端口号；
//!   - 命名空间在构造时固定，拨号地址中的 namespace 不参与目标；
//!   - 每个子集独立解析端口：命中具名端口取其端口号，否则把 `port` 原样当作端口号；
//!   - 所有子集的所有地址展开为 `ip:port` 实例，顺序与列举结果一致。
//! - **风险 (Trade-offs)**：编排器可能发出重复或瞬时事件，每个事件都会引发一次完整重列。

use std::sync::Arc;

use async_trait::async_trait;

use super::{ChangeStream, Discovery, DiscoverySettings, SnapshotSource, SnapshotWatch, start_watch};
use crate::{
    backend::{Endpoints, EndpointsApi},
    config::{DEFAULT_ORCHESTRATOR_NAMESPACE, RegistryConfig},
    error::{BackendError, RegistryError},
    instance::{Instance, Snapshot},
};

/// 基于 [`EndpointsApi`] 的发现实现。
#[derive(Clone)]
pub struct EndpointsDiscovery {
    api: Arc<dyn EndpointsApi>,
    namespace: String,
    settings: DiscoverySettings,
}

impl EndpointsDiscovery {
    pub const SCHEME: &'static str = "k8s";

    /// `namespace` 为空时使用 `default`。
    pub fn new(
        api: Arc<dyn EndpointsApi>,
        namespace: impl Into<String>,
        settings: DiscoverySettings,
    ) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.trim().is_empty() {
            DEFAULT_ORCHESTRATOR_NAMESPACE.to_owned()
        } else {
            namespace
        };
        Self {
            api,
            namespace,
            settings,
        }
    }

    pub fn from_config(api: Arc<dyn EndpointsApi>, config: &RegistryConfig) -> Self {
        Self::new(
            api,
            config.orchestrator_namespace(),
            DiscoverySettings::from_config(config),
        )
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// 拆分 `<service>:<port>`。
pub fn parse_target(target: &str) -> Result<(&str, &str), RegistryError> {
    let mut parts = target.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(port), None) if !service.is_empty() && !port.is_empty() => {
            Ok((service, port))
        }
        _ => Err(RegistryError::InvalidTarget {
            target: target.to_owned(),
            reason: "expected `<service>:<port>`",
        }),
    }
}

/// 把 Endpoints 对象展开为实例快照。
pub fn flatten(objects: &[Endpoints], port: &str) -> Snapshot {
    objects
        .iter()
        .flat_map(|object| object.subsets.iter())
        .flat_map(|subset| {
            let resolved = subset.resolve_port(port);
            subset
                .addresses
                .iter()
                .map(move |address| Instance::new(format!("{}:{resolved}", address.ip)))
        })
        .collect()
}

#[async_trait]
impl Discovery for EndpointsDiscovery {
    fn scheme(&self) -> &'static str {
        Self::SCHEME
    }

    fn format_target(&self, _namespace: &str, endpoint: &str) -> String {
        endpoint.to_owned()
    }

    async fn discover(&self, target: &str) -> Result<SnapshotWatch, RegistryError> {
        let (service, port) = parse_target(target)?;
        let source = EndpointsSource {
            api: Arc::clone(&self.api),
            namespace: self.namespace.clone(),
            service: service.to_owned(),
            port: port.to_owned(),
        };
        start_watch(source, target.to_owned(), self.settings.clone()).await
    }
}

struct EndpointsSource {
    api: Arc<dyn EndpointsApi>,
    namespace: String,
    service: String,
    port: String,
}

#[async_trait]
impl SnapshotSource for EndpointsSource {
    async fn subscribe(&self) -> Result<ChangeStream, BackendError> {
        self.api.watch(&self.namespace, &self.service).await
    }

    async fn list(&self) -> Result<Snapshot, BackendError> {
        let objects = self.api.list(&self.namespace, &self.service).await?;
        Ok(flatten(&objects, &self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EndpointAddress, EndpointPort, EndpointSubset};

    #[test]
    fn target_needs_exactly_one_colon() {
        assert_eq!(parse_target("orders:http").unwrap(), ("orders", "http"));
        for bad in ["orders", "orders:", ":http", "a:b:c", ""] {
            assert!(parse_target(bad).is_err(), "{bad} 应被拒绝");
        }
    }

    #[test]
    fn subsets_resolve_ports_independently() {
        let objects = vec![Endpoints {
            name: "orders".into(),
            subsets: vec![
                EndpointSubset {
                    addresses: vec![
                        EndpointAddress { ip: "10.0.0.7".into() },
                        EndpointAddress { ip: "10.0.0.8".into() },
                    ],
                    ports: vec![EndpointPort {
                        name: Some("http".into()),
                        port: 8080,
                    }],
                },
                EndpointSubset {
                    addresses: vec![EndpointAddress { ip: "10.0.1.1".into() }],
                    ports: vec![EndpointPort {
                        name: Some("grpc".into()),
                        port: 9090,
                    }],
                },
            ],
        }];
        let addresses: Vec<_> = flatten(&objects, "http")
            .into_iter()
            .map(|instance| instance.address)
            .collect();
        assert_eq!(
            addresses,
            vec!["10.0.0.7:8080", "10.0.0.8:8080", "10.0.1.1:http"]
        );
    }

    #[test]
    fn empty_namespace_defaults() {
        let api = Arc::new(crate::backend::memory::InMemoryEndpoints::new());
        let discovery = EndpointsDiscovery::new(api, " ", DiscoverySettings::new());
        assert_eq!(discovery.namespace(), "default");
        assert_eq!(discovery.format_target("prod", "orders:http"), "orders:http");
    }
}
