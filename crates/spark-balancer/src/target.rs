//! 拨号地址解析：`scheme://namespace/endpoint`。
//!
//! - `scheme` 选择发现后端，必须非空；
//! - `namespace` 可以为空（如 `k8s:///orders:http`，编排器后端的命名空间在构造时固定）；
//! - `endpoint` 为第一个 `/` 之后的全部内容，必须非空。

use std::fmt;

use crate::error::BalancerError;

/// 解析后的拨号地址。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialTarget {
    pub scheme: String,
    pub namespace: String,
    pub endpoint: String,
}

impl DialTarget {
    pub fn parse(raw: &str) -> Result<Self, BalancerError> {
        let invalid = |reason| BalancerError::InvalidTarget {
            target: raw.to_owned(),
            reason,
        };

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing `://`"))?;
        if scheme.is_empty() {
            return Err(invalid("scheme is empty"));
        }
        let (namespace, endpoint) = rest
            .split_once('/')
            .ok_or_else(|| invalid("expected `scheme://namespace/endpoint`"))?;
        if endpoint.is_empty() {
            return Err(invalid("endpoint is empty"));
        }

        Ok(Self {
            scheme: scheme.to_owned(),
            namespace: namespace.to_owned(),
            endpoint: endpoint.to_owned(),
        })
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.namespace, self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_and_orchestrator_targets() {
        let etcd = DialTarget::parse("etcd://prod/orders").unwrap();
        assert_eq!(
            (etcd.scheme.as_str(), etcd.namespace.as_str(), etcd.endpoint.as_str()),
            ("etcd", "prod", "orders")
        );
        assert_eq!(etcd.to_string(), "etcd://prod/orders");

        let k8s = DialTarget::parse("k8s:///orders:http").unwrap();
        assert_eq!(k8s.namespace, "");
        assert_eq!(k8s.endpoint, "orders:http");
    }

    #[test]
    fn rejects_malformed_targets() {
        for bad in ["orders", "://prod/orders", "etcd://prod", "etcd://prod/"] {
            assert!(
                matches!(
                    DialTarget::parse(bad),
                    Err(BalancerError::InvalidTarget { .. })
                ),
                "{bad} 应被拒绝"
            );
        }
    }
}
