//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义注册会话、服务发现与后端契约的错误语义；
//! - 区分“配置错误”（立即失败、不可重试）与“后端错误”（由会话/监听循环吸收并按节拍重试）。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，保留 `source` 链；
//! - [`RegistryError::Configuration`] 与 [`RegistryError::InvalidTarget`] 仅在调用点同步返回；
//! - [`BackendError`] 只在首次尝试时向调用方暴露，之后的失败一律记录为 WARN 并重试。

use std::time::Duration;

use thiserror::Error;

use crate::backend::LeaseId;

/// 注册中心后端（协调存储或编排器）单次往返失败。
///
/// # 教案式说明
/// - **意图 (Why)**：为租约、读写、监听等远程调用提供统一错误域，便于分类与重试；
/// - **契约 (What)**：所有变体满足 `Send + Sync + 'static`，可以跨任务传播；
/// - **风险 (Trade-offs)**：`Unavailable` 仅携带文本描述，具体后端需自行把底层错误格式化进去。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// 后端暂不可用或拒绝了请求。
    #[error("backend unavailable: {detail}")]
    Unavailable { detail: String },

    /// 续约或绑定时租约已经过期或被回收。
    #[error("lease {lease} is not found or already expired")]
    LeaseNotFound { lease: LeaseId },

    /// 单次往返超出统一的后端超时。
    #[error("backend call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl BackendError {
    /// 便捷构造 `Unavailable`。
    pub fn unavailable(detail: impl Into<String>) -> Self {
        BackendError::Unavailable {
            detail: detail.into(),
        }
    }
}

/// spark-registry 对外暴露的错误域。
#[derive(Debug, Error)]
pub enum RegistryError {
    /// 注册参数缺失必填字段。
    ///
    /// - **契约 (What)**：`field` 为缺失字段名；该错误在会话启动前返回，绝不会进入重试循环。
    #[error("registration option `{field}` is required")]
    Configuration { field: &'static str },

    /// 发现目标无法按所选后端的语法解析。
    #[error("discovery target `{target}` is invalid: {reason}")]
    InvalidTarget { target: String, reason: &'static str },

    /// 首次后端调用失败（例如建立监听），调用方可以据此决定是否稍后重建。
    #[error("backend call `{op}` failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },

    /// 注册记录序列化失败。
    #[error("failed to encode registration record: {0}")]
    Encode(#[from] serde_json::Error),

    /// TOML 配置无法解析。
    #[error("invalid registry configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// 日志订阅器安装失败。
    #[error("failed to install logging: {0}")]
    Logging(String),
}

impl RegistryError {
    /// 为后端错误附加操作名。
    pub fn backend(op: &'static str, source: BackendError) -> Self {
        RegistryError::Backend { op, source }
    }

    /// 是否属于“配置类”致命错误。
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RegistryError::Configuration { .. }
                | RegistryError::InvalidTarget { .. }
                | RegistryError::Config(_)
        )
    }
}
