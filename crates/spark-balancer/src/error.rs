//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - [`BalancerError`] 只在构建解析器时同步返回：拨号地址不合法、scheme 未注册、首次订阅失败；
//! - [`PickError`] 是调用路径上唯一可见的选路失败，映射为 `Unavailable` 状态码。

use spark_registry::{RegistryError, StatusCode};
use thiserror::Error;

/// 解析桥接的错误域。
#[derive(Debug, Error)]
pub enum BalancerError {
    /// 拨号地址不符合 `scheme://namespace/endpoint`。
    #[error("dial target `{target}` is invalid: {reason}")]
    InvalidTarget { target: String, reason: &'static str },

    /// 解析注册表中没有该 scheme 的发现实现。
    #[error("no discovery is registered for scheme `{scheme}`")]
    UnknownScheme { scheme: String },

    /// 发现层同步返回的失败（目标语法或首次订阅）。
    #[error(transparent)]
    Discovery(#[from] RegistryError),
}

impl BalancerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BalancerError::InvalidTarget { .. } => StatusCode::InvalidArgument,
            BalancerError::UnknownScheme { .. } => StatusCode::NotFound,
            BalancerError::Discovery(err) if err.is_configuration() => StatusCode::InvalidArgument,
            BalancerError::Discovery(_) => StatusCode::Unavailable,
        }
    }
}

/// 选路失败。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PickError {
    /// 当前就绪集合为空。
    #[error("no connection is available")]
    NoConnectionAvailable,
}

impl PickError {
    pub fn status(&self) -> StatusCode {
        StatusCode::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(
            PickError::NoConnectionAvailable.status(),
            StatusCode::Unavailable
        );
        let unknown = BalancerError::UnknownScheme {
            scheme: "zk".into(),
        };
        assert_eq!(unknown.status(), StatusCode::NotFound);
        assert_eq!(
            unknown.to_string(),
            "no discovery is registered for scheme `zk`"
        );

        let target = BalancerError::from(RegistryError::InvalidTarget {
            target: "orders".into(),
            reason: "expected `<namespace>.<service>`",
        });
        assert_eq!(target.status(), StatusCode::InvalidArgument);
    }
}
