//! 基于 `kube` 的 Endpoints 读取实现（feature `kubernetes`）。
//!
//! - 监听与列举都用 `metadata.name=<name>` 字段选择器限定到单个对象；
//! - 监听从资源版本 `0` 开始，服务端关闭连接（默认约 5 分钟）时流结束，由发现层重新订阅；
//! - 监听流中的错误条目被丢弃，发现层只关心“发生过变更”；
//! - 端口号超出 `u16` 的条目被忽略。

use async_trait::async_trait;
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1 as core;
use kube::{
    Api, Client,
    api::{ListParams, WatchParams},
};

use super::endpoints::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, EndpointsApi, EndpointsWatch,
};
use crate::error::BackendError;

/// 通过 API Server 读取 `core/v1` Endpoints。
#[derive(Clone)]
pub struct KubeEndpoints {
    client: Client,
}

impl KubeEndpoints {
    /// 按集群内或 kubeconfig 的默认配置建立客户端。
    pub async fn try_default() -> Result<Self, BackendError> {
        let client = Client::try_default()
            .await
            .map_err(|err| BackendError::unavailable(format!("kube client: {err}")))?;
        Ok(Self { client })
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<core::Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl EndpointsApi for KubeEndpoints {
    async fn watch(&self, namespace: &str, name: &str) -> Result<EndpointsWatch, BackendError> {
        let params = WatchParams::default().fields(&name_selector(name));
        let events = self
            .api(namespace)
            .watch(&params, "0")
            .await
            .map_err(|err| BackendError::unavailable(format!("kube watch: {err}")))?;
        Ok(events
            .filter_map(|event| future::ready(event.ok().map(|_| ())))
            .boxed())
    }

    async fn list(&self, namespace: &str, name: &str) -> Result<Vec<Endpoints>, BackendError> {
        let params = ListParams::default().fields(&name_selector(name));
        let objects = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|err| BackendError::unavailable(format!("kube list: {err}")))?;
        Ok(objects.items.iter().map(convert_endpoints).collect())
    }
}

fn name_selector(name: &str) -> String {
    format!("metadata.name={name}")
}

/// API 对象到发现层 Endpoints 模型的转换；只保留就绪地址。
fn convert_endpoints(object: &core::Endpoints) -> Endpoints {
    Endpoints {
        name: object.metadata.name.clone().unwrap_or_default(),
        subsets: object
            .subsets
            .iter()
            .flatten()
            .map(|subset| EndpointSubset {
                addresses: subset
                    .addresses
                    .iter()
                    .flatten()
                    .map(|address| EndpointAddress {
                        ip: address.ip.clone(),
                    })
                    .collect(),
                ports: subset
                    .ports
                    .iter()
                    .flatten()
                    .filter_map(|port| {
                        u16::try_from(port.port).ok().map(|number| EndpointPort {
                            name: port.name.clone(),
                            port: number,
                        })
                    })
                    .collect(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn address(ip: &str) -> core::EndpointAddress {
        core::EndpointAddress {
            ip: ip.to_owned(),
            ..Default::default()
        }
    }

    fn port(name: Option<&str>, number: i32) -> core::EndpointPort {
        core::EndpointPort {
            name: name.map(str::to_owned),
            port: number,
            ..Default::default()
        }
    }

    #[test]
    fn api_object_is_flattened_into_the_discovery_model() {
        let object = core::Endpoints {
            metadata: ObjectMeta {
                name: Some("orders".to_owned()),
                namespace: Some("prod".to_owned()),
                ..Default::default()
            },
            subsets: Some(vec![core::EndpointSubset {
                addresses: Some(vec![address("10.0.0.7"), address("10.0.0.8")]),
                not_ready_addresses: Some(vec![address("10.0.0.9")]),
                ports: Some(vec![port(Some("http"), 8080), port(None, 70_000)]),
            }]),
        };

        let converted = convert_endpoints(&object);
        assert_eq!(converted.name, "orders");
        assert_eq!(converted.subsets.len(), 1);
        let subset = &converted.subsets[0];
        assert_eq!(
            subset.addresses,
            vec![
                EndpointAddress {
                    ip: "10.0.0.7".into()
                },
                EndpointAddress {
                    ip: "10.0.0.8".into()
                },
            ]
        );
        assert_eq!(
            subset.ports,
            vec![EndpointPort {
                name: Some("http".into()),
                port: 8080
            }]
        );
        assert_eq!(subset.resolve_port("http"), "8080");
    }

    #[test]
    fn empty_object_has_no_subsets() {
        let converted = convert_endpoints(&core::Endpoints::default());
        assert_eq!(converted, Endpoints::default());
        assert_eq!(name_selector("orders"), "metadata.name=orders");
    }
}
