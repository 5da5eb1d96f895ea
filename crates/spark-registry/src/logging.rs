//! 日志安装入口。
//!
//! # 教案式说明
//! - **意图 (Why)**：注册会话与发现监听把所有被吸收的后端失败写成 `tracing` 事件，宿主需要一个
//!   “一次调用即可看到这些事件”的入口；
//! - **逻辑 (How)**：`tracing_subscriber::registry()` 叠加 `EnvFilter` 与 `fmt` 层，
//!   过滤表达式优先取参数，其次取 `RUST_LOG`，最后回落到 `info`；
//! - **契约 (What)**：进程内只能成功安装一次；重复调用或宿主已设置全局订阅器时返回
//!   [`RegistryError::Logging`]，不会覆盖已有订阅器。

use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

use crate::error::RegistryError;

static INSTALLED: OnceLock<String> = OnceLock::new();

/// 安装全局 `fmt` 订阅器。
pub fn install(filter: Option<&str>) -> Result<(), RegistryError> {
    if INSTALLED.get().is_some() {
        return Err(RegistryError::Logging(
            "spark-registry logging is already installed".to_owned(),
        ));
    }
    if dispatcher::has_been_set() {
        return Err(RegistryError::Logging(
            "a global tracing subscriber is already set".to_owned(),
        ));
    }

    let env_filter = build_env_filter(filter)?;
    let directive = env_filter.to_string();
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| RegistryError::Logging(err.to_string()))?;

    INSTALLED
        .set(directive)
        .map_err(|_| RegistryError::Logging("spark-registry logging is already installed".to_owned()))
}

/// 已安装的过滤表达式。
pub fn installed_filter() -> Option<&'static str> {
    INSTALLED.get().map(String::as_str)
}

fn build_env_filter(filter: Option<&str>) -> Result<EnvFilter, RegistryError> {
    match filter {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|err| RegistryError::Logging(format!("invalid filter `{directive}`: {err}"))),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}
