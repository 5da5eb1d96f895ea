//! # 配置
//!
//! ## 契约（What）
//! - 配置以 TOML 表达，`[registry]` 描述后端调用与发现的公共参数，可选的 `[registration]`
//!   描述本进程的注册内容；
//! - 所有时长以毫秒/秒整数给出，零值回落到默认值；
//! - `[registration]` 只能经由 [`RegistrationOptions::builder`] 转换，因而与代码构造走同一套校验。
//!
//! ```toml
//! [registry]
//! prefix = "registry.etcd"
//! backend_timeout_ms = 10000
//!
//! [registration]
//! service_name = "orders"
//! namespace = "prod"
//! address = "10.0.0.5:9090"
//! ttl_secs = 30
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::{
    error::RegistryError,
    instance::{DEFAULT_REGISTRY_PREFIX, RegistrationOptions},
};

/// 统一的后端往返超时默认值。
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(10);
/// 监听流中断后重新订阅的等待间隔默认值。
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// 解析桥接等待首个快照的上限。
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(60);
/// 编排器后端默认的命名空间。
pub const DEFAULT_ORCHESTRATOR_NAMESPACE: &str = "default";

/// `[registry]` 表。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    pub prefix: String,
    pub backend_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub resolve_timeout_ms: u64,
    pub orchestrator_namespace: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_REGISTRY_PREFIX.to_owned(),
            backend_timeout_ms: millis(DEFAULT_BACKEND_TIMEOUT),
            retry_interval_ms: millis(DEFAULT_RETRY_INTERVAL),
            resolve_timeout_ms: millis(DEFAULT_RESOLVE_TIMEOUT),
            orchestrator_namespace: DEFAULT_ORCHESTRATOR_NAMESPACE.to_owned(),
        }
    }
}

impl RegistryConfig {
    /// 根前缀，去掉首尾 `/`；为空时回落到默认值。
    pub fn prefix(&self) -> &str {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            DEFAULT_REGISTRY_PREFIX
        } else {
            trimmed
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        or_default(self.backend_timeout_ms, DEFAULT_BACKEND_TIMEOUT)
    }

    pub fn retry_interval(&self) -> Duration {
        or_default(self.retry_interval_ms, DEFAULT_RETRY_INTERVAL)
    }

    pub fn resolve_timeout(&self) -> Duration {
        or_default(self.resolve_timeout_ms, DEFAULT_RESOLVE_TIMEOUT)
    }

    pub fn orchestrator_namespace(&self) -> &str {
        if self.orchestrator_namespace.trim().is_empty() {
            DEFAULT_ORCHESTRATOR_NAMESPACE
        } else {
            &self.orchestrator_namespace
        }
    }
}

/// `[registration]` 表。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrationConfig {
    pub service_name: String,
    pub namespace: String,
    pub address: String,
    pub ttl_secs: u64,
    pub renew_interval_secs: u64,
    pub weight: Option<u32>,
}

impl RegistrationConfig {
    /// 转换为校验过的注册参数。
    pub fn to_options(&self) -> Result<RegistrationOptions, RegistryError> {
        let mut builder = RegistrationOptions::builder()
            .service_name(self.service_name.as_str())
            .namespace(self.namespace.as_str())
            .address(self.address.as_str())
            .ttl(Duration::from_secs(self.ttl_secs))
            .renew_interval(Duration::from_secs(self.renew_interval_secs));
        if let Some(weight) = self.weight {
            builder = builder.weight(weight);
        }
        builder.build()
    }
}

/// 完整的配置文件。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryFile {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub registration: Option<RegistrationConfig>,
}

impl RegistryFile {
    pub fn from_toml_str(input: &str) -> Result<Self, RegistryError> {
        Ok(toml::from_str(input)?)
    }

    /// `[registration]` 存在时返回校验后的注册参数。
    pub fn registration_options(&self) -> Option<Result<RegistrationOptions, RegistryError>> {
        self.registration.as_ref().map(RegistrationConfig::to_options)
    }
}

fn or_default(ms: u64, default: Duration) -> Duration {
    if ms == 0 {
        default
    } else {
        Duration::from_millis(ms)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let file = RegistryFile::from_toml_str("").unwrap();
        assert_eq!(file.registry.prefix(), "registry.etcd");
        assert_eq!(file.registry.backend_timeout(), DEFAULT_BACKEND_TIMEOUT);
        assert_eq!(file.registry.resolve_timeout(), Duration::from_secs(60));
        assert_eq!(file.registry.orchestrator_namespace(), "default");
        assert!(file.registration_options().is_none());
    }

    #[test]
    fn registration_section_is_validated() {
        let file = RegistryFile::from_toml_str(
            r#"
            [registry]
            prefix = "/services/"
            backend_timeout_ms = 2500

            [registration]
            service_name = "orders"
            namespace = "prod"
            address = "10.0.0.5:9090"
            ttl_secs = 30
            renew_interval_secs = 45
            weight = 2
            "#,
        )
        .unwrap();
        assert_eq!(file.registry.prefix(), "services");
        assert_eq!(file.registry.backend_timeout(), Duration::from_millis(2500));

        let options = file.registration_options().unwrap().unwrap();
        assert_eq!(options.renew_interval(), Duration::from_secs(10));
        assert_eq!(options.weight(), Some(2));
    }

    #[test]
    fn incomplete_registration_is_rejected() {
        let file = RegistryFile::from_toml_str(
            r#"
            [registration]
            service_name = "orders"
            "#,
        )
        .unwrap();
        let err = file.registration_options().unwrap().unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Configuration { field: "namespace" }
        ));
    }

    #[test]
    fn unknown_keys_fail_fast() {
        let err = RegistryFile::from_toml_str("[registry]\nprefx = \"typo\"\n").unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }
}
