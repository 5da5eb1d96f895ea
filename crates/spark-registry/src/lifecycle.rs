//! # 生命周期钩子
//!
//! ## 核心意图（Why）
//! - 注册会话、解析注册表等长生命周期组件需要统一的 `init` / `reload` / `close` 驱动点，
//!   宿主无需逐个记住它们的关闭顺序；
//! - 注册表显式构造并由宿主持有，不存在进程级全局表。
//!
//! ## 行为契约（What）
//! - `init_all` 与 `reload_all` 按注册顺序执行，`close_all` 逆序执行；
//! - 任一组件失败不会阻止其余组件执行：失败以 WARN 记录，最终返回第一个错误；
//! - 未覆写的钩子默认成功。

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{config::RegistryConfig, error::RegistryError};

/// 可被 [`LifecycleRegistry`] 驱动的组件。
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// 日志中使用的组件名。
    fn name(&self) -> &str;

    async fn init(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn reload(&self, _config: &RegistryConfig) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Init,
    Reload,
    Close,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Reload => "reload",
            Phase::Close => "close",
        }
    }
}

/// 按注册顺序保存组件的生命周期表。
#[derive(Default)]
pub struct LifecycleRegistry {
    components: Mutex<Vec<Arc<dyn Lifecycle>>>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: Arc<dyn Lifecycle>) {
        self.components.lock().push(component);
    }

    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.lock().is_empty()
    }

    pub async fn init_all(&self) -> Result<(), RegistryError> {
        let components = self.snapshot();
        let mut first = None;
        for component in &components {
            record(Phase::Init, component.as_ref(), component.init().await, &mut first);
        }
        first.map_or(Ok(()), Err)
    }

    pub async fn reload_all(&self, config: &RegistryConfig) -> Result<(), RegistryError> {
        let components = self.snapshot();
        let mut first = None;
        for component in &components {
            let result = component.reload(config).await;
            record(Phase::Reload, component.as_ref(), result, &mut first);
        }
        first.map_or(Ok(()), Err)
    }

    /// 逆序关闭全部组件。
    pub async fn close_all(&self) -> Result<(), RegistryError> {
        let components = self.snapshot();
        let mut first = None;
        for component in components.iter().rev() {
            record(Phase::Close, component.as_ref(), component.close().await, &mut first);
        }
        first.map_or(Ok(()), Err)
    }

    // 钩子执行期间不持锁，组件可以在钩子里继续注册。
    fn snapshot(&self) -> Vec<Arc<dyn Lifecycle>> {
        self.components.lock().clone()
    }
}

fn record(
    phase: Phase,
    component: &dyn Lifecycle,
    result: Result<(), RegistryError>,
    first: &mut Option<RegistryError>,
) {
    match result {
        Ok(()) => info!(
            component = component.name(),
            phase = phase.as_str(),
            "lifecycle hook finished"
        ),
        Err(err) => {
            warn!(
                component = component.name(),
                phase = phase.as_str(),
                error = %err,
                "lifecycle hook failed"
            );
            first.get_or_insert(err);
        }
    }
}
