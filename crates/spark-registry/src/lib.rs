//! # spark-registry
//!
//! ## 定位与职责（Why）
//! - 服务端进程通过 [`RegistrationSession`] 把自己发布为某个逻辑服务的存活实例，并依靠租约续约维持记录；
//! - 客户端通过 [`Discovery`] 把逻辑服务名变成持续更新的全量实例快照，交给上层的解析桥接与选路器。
//!
//! ## 架构嵌入（Where）
//! - `backend` 模块约定协调存储与编排器 Endpoints 的最小契约，并提供带故障注入的内存实现；
//! - `registration` 模块负责租约授予、续约、失败后重新注册与关闭时的注销；
//! - `discovery` 模块提供两种后端的监听实现，共享同一个“先列举、逐事件重列”的监听循环；
//! - `config`、`logging`、`lifecycle`、`status` 模块提供配置解析、日志安装、生命周期驱动与结果分类。
//!
//! ## 约束（What）
//! - 所有后端往返受统一超时约束；首次调用之后的后端失败一律以 WARN 记录并按节拍重试；
//! - 后台任务都由句柄值拥有，`close().await` 返回即代表任务已退出。

pub mod backend;

/// 配置模型与 TOML 解析。
pub mod config;

pub mod discovery;

/// 错误类型集中声明处。
///
/// - **契约定位 (What)**：使用 `thiserror::Error` 派生，保留 `source` 链；
/// - **风险提示 (Trade-offs)**：配置类错误不可重试，后端错误在首次尝试之后由循环吸收。
pub mod error;

pub mod instance;
pub mod lifecycle;
pub mod logging;
pub mod registration;
pub mod status;

pub use backend::{CoordinationStore, EndpointsApi, LeaseId};
pub use config::{RegistrationConfig, RegistryConfig, RegistryFile};
pub use discovery::{
    Discovery, DiscoverySettings, EndpointsDiscovery, SnapshotStream, SnapshotWatch,
    StoreDiscovery, WatchHandle,
};
pub use error::{BackendError, RegistryError};
pub use instance::{Instance, RegistrationOptions, RegistrationOptionsBuilder, Snapshot};
pub use lifecycle::{Lifecycle, LifecycleRegistry};
pub use registration::{RegistrationSession, SessionSettings, SessionState};
pub use status::{Classify, DefaultClassifier, StatusCode};
