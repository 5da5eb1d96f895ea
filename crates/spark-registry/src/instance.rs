//! # 实例模型
//!
//! ## 核心意图（Why）
//! - [`Instance`] 是发现层产出、选路层消费的唯一数据单元：地址加可选权重；
//! - [`RegistrationOptions`] 描述本进程要发布的成员记录，构造即校验，之后不可变。
//!
//! ## 行为契约（What）
//! - `service_name`、`namespace`、`address` 缺一不可，缺失时构造器返回
//!   [`RegistryError::Configuration`]；
//! - `ttl` 为零时取 30 秒，其余值向上取整到整秒（至少 1 秒），与后端授予的租约时长一致；
//! - `renew_interval` 不在 `[ttl/3, ttl]` 内时取 `ttl/3`，保证一个租约周期内至少有三次续约机会；
//! - 权重上限为 [`MAX_WEIGHT`]，超出的值按上限处理；
//! - 注册记录的线上格式是 `RegistrationOptions` 的 JSON，时长以毫秒整数编码。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// 未配置 TTL 时使用的租约时长。
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// 注册记录在协调存储中的默认根前缀（不含 `/`）。
pub const DEFAULT_REGISTRY_PREFIX: &str = "registry.etcd";

/// 实例权重上限。选路器按权重展开连接，远端记录中的权重必须有界。
pub const MAX_WEIGHT: u32 = 1_000;

/// 服务的一个可路由实例。
///
/// - **契约 (What)**：除地址外没有身份；地址相同的两个实例可互换；
/// - `weight` 为 `None` 时按 1 处理，见 [`Instance::effective_weight`]。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl Instance {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight: None,
        }
    }

    /// 附加权重；`0` 视为未指定，超过 [`MAX_WEIGHT`] 按上限处理。
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = normalize_weight(weight);
        self
    }

    /// 选路时实际使用的权重，落在 `[1, MAX_WEIGHT]`。
    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(1).clamp(1, MAX_WEIGHT)
    }
}

/// 一次完整的成员快照：整体替换，绝不是增量。
pub type Snapshot = Vec<Instance>;

/// 本进程的注册参数。
///
/// # 教案式说明
/// - **意图 (Why)**：会话启动前一次性确定注册内容与续约节奏，运行期间只读共享；
/// - **契约 (What)**：只能通过 [`RegistrationOptions::builder`] 构造，因此持有该值即意味着
///   必填字段非空且 `ttl/3 <= renew_interval <= ttl`；
/// - **风险 (Trade-offs)**：后端租约以秒为粒度，`ttl` 在构造时已向上取整到整秒。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistrationOptions {
    service_name: String,
    namespace: String,
    address: String,
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    ttl: Duration,
    #[serde(rename = "renew_interval_ms", with = "duration_ms")]
    renew_interval: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight: Option<u32>,
}

impl RegistrationOptions {
    pub fn builder() -> RegistrationOptionsBuilder {
        RegistrationOptionsBuilder::default()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    pub fn weight(&self) -> Option<u32> {
        self.weight
    }

    /// `<namespace>.<service_name>`，即协调存储后端的发现目标。
    pub fn service_key(&self) -> String {
        service_key(&self.namespace, &self.service_name)
    }

    /// 本实例在发现层的表现形式。
    pub fn instance(&self) -> Instance {
        Instance {
            address: self.address.clone(),
            weight: self.weight,
        }
    }

    /// 序列化为注册记录值。
    pub fn encode(&self) -> Result<Vec<u8>, RegistryError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// [`RegistrationOptions`] 的可失败构造器。
#[derive(Clone, Debug, Default)]
pub struct RegistrationOptionsBuilder {
    service_name: String,
    namespace: String,
    address: String,
    ttl: Duration,
    renew_interval: Duration,
    weight: Option<u32>,
}

impl RegistrationOptionsBuilder {
    pub fn service_name(mut self, value: impl Into<String>) -> Self {
        self.service_name = value.into();
        self
    }

    pub fn namespace(mut self, value: impl Into<String>) -> Self {
        self.namespace = value.into();
        self
    }

    pub fn address(mut self, value: impl Into<String>) -> Self {
        self.address = value.into();
        self
    }

    pub fn ttl(mut self, value: Duration) -> Self {
        self.ttl = value;
        self
    }

    pub fn renew_interval(mut self, value: Duration) -> Self {
        self.renew_interval = value;
        self
    }

    pub fn weight(mut self, value: u32) -> Self {
        self.weight = normalize_weight(value);
        self
    }

    /// 校验必填字段并规范化时长。
    ///
    /// - **契约 (What)**：缺失字段按 `service_name → namespace → address` 的顺序报告第一个；
    /// - **后置条件**：`ttl` 为不小于 1 秒的整秒数，且 `0 < ttl/3 <= renew_interval <= ttl`。
    pub fn build(self) -> Result<RegistrationOptions, RegistryError> {
        let service_name = required("service_name", self.service_name)?;
        let namespace = required("namespace", self.namespace)?;
        let address = required("address", self.address)?;

        let ttl = if self.ttl.is_zero() {
            DEFAULT_TTL
        } else {
            lease_ttl(self.ttl)
        };
        let renew_interval = clamp_renew_interval(ttl, self.renew_interval);

        Ok(RegistrationOptions {
            service_name,
            namespace,
            address,
            ttl,
            renew_interval,
            weight: self.weight,
        })
    }
}

fn required(field: &'static str, value: String) -> Result<String, RegistryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::Configuration { field });
    }
    Ok(trimmed.to_owned())
}

/// 租约粒度为整秒：向上取整，至少 1 秒。
pub fn lease_ttl(ttl: Duration) -> Duration {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    Duration::from_secs(secs.max(1))
}

fn normalize_weight(weight: u32) -> Option<u32> {
    (weight > 0).then(|| weight.min(MAX_WEIGHT))
}

/// 续约间隔必须落在 `[ttl/3, ttl]`，否则取 `ttl/3`。
pub fn clamp_renew_interval(ttl: Duration, renew_interval: Duration) -> Duration {
    let floor = ttl / 3;
    if renew_interval < floor || renew_interval > ttl {
        floor
    } else {
        renew_interval
    }
}

/// `<namespace>.<service_name>`。
pub fn service_key(namespace: &str, service_name: &str) -> String {
    format!("{namespace}.{service_name}")
}

/// 某个服务全部实例所在的前缀：`/<prefix>/<service_key>/`。
pub fn service_prefix(registry_prefix: &str, service_key: &str) -> String {
    format!("/{registry_prefix}/{service_key}/")
}

/// 单个实例的注册键：`/<prefix>/<namespace>.<service_name>/<uid>`。
pub fn instance_key(registry_prefix: &str, options: &RegistrationOptions, uid: &str) -> String {
    format!(
        "{}{uid}",
        service_prefix(registry_prefix, &options.service_key())
    )
}

/// 发现侧只关心的记录字段；未知字段被忽略。
#[derive(Debug, Deserialize)]
struct InstanceRecord {
    address: String,
    #[serde(default)]
    weight: Option<u32>,
}

/// 将注册记录值解码为实例。
pub fn decode_instance(value: &[u8]) -> Result<Instance, serde_json::Error> {
    let record: InstanceRecord = serde_json::from_slice(value)?;
    Ok(Instance {
        address: record.address,
        weight: record.weight.and_then(normalize_weight),
    })
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}
