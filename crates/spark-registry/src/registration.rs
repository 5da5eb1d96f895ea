//! # 注册会话
//!
//! ## 核心意图（Why）
//! - 把“本进程是服务 X 的一个存活实例”这件事写进协调存储，并由租约保证进程消失后记录自动过期；
//! - 续约失败不是致命错误：会话在同一节拍内重新注册，直到显式关闭。
//!
//! ## 执行流程（How）
//! 1. 后台任务启动后先做一次注册：`grant(ttl)` → `put(key, record, lease)`；
//! 2. 每个 `renew_interval` 节拍（首个节拍在启动后一个间隔，错过的节拍顺延而非补发）：
//!    上一轮成功则 `keep_alive_once`，失败或上一轮已失败则在同一节拍内完整重新注册；
//! 3. 关闭信号到达后：`delete(key)`，再 `revoke(lease)`，失败只记录 WARN。
//!
//! ## 契约（What）
//! - 键格式：`/<prefix>/<namespace>.<service_name>/<instance_uid>`，`instance_uid` 为 32 位小写十六进制；
//! - 任一时刻会话只认一个租约：重新注册先授予新租约并写入记录，再尽力回收旧租约；
//! - 每次后端往返都受统一的 `backend_timeout` 约束；每次失败都以 WARN 记录分类后的状态码；
//! - [`RegistrationSession::close`] 幂等，返回时注销已经完成；未关闭就丢弃会话只发出关闭信号。
//!
//! ## 风险与权衡（Trade-offs）
//! - 失败后不做退避，重试节奏就是续约节奏；
//! - `close` 期间的后端调用同样受超时约束，最坏情况下 `close` 需要两个 `backend_timeout`。

use std::{error::Error, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, oneshot, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
    backend::{CoordinationStore, LeaseId, call_with_timeout},
    config::{DEFAULT_BACKEND_TIMEOUT, RegistryConfig},
    error::{BackendError, RegistryError},
    instance::{DEFAULT_REGISTRY_PREFIX, RegistrationOptions, instance_key},
    lifecycle::Lifecycle,
    status::{Classify, DefaultClassifier, StatusCode},
};

/// 会话对外可见的状态。
///
/// 续约失败后的中间态并入 `Registering`：会话总是在同一节拍内重新注册。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registering,
    Registered,
    Closing,
}

/// 会话运行参数：键前缀、统一后端超时与错误分类器。
#[derive(Clone)]
pub struct SessionSettings {
    prefix: String,
    backend_timeout: Duration,
    classifier: Arc<dyn Classify>,
}

impl SessionSettings {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_REGISTRY_PREFIX.to_owned(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            classifier: Arc::new(DefaultClassifier),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new()
            .with_prefix(config.prefix())
            .with_backend_timeout(config.backend_timeout())
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classify>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend_timeout(&self) -> Duration {
        self.backend_timeout
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("prefix", &self.prefix)
            .field("backend_timeout", &self.backend_timeout)
            .finish_non_exhaustive()
    }
}

/// 会话任务与句柄共享的状态。
struct Shared {
    options: RegistrationOptions,
    uid: String,
    key: String,
    record: Vec<u8>,
    store: Arc<dyn CoordinationStore>,
    settings: SessionSettings,
    lease: Mutex<Option<LeaseId>>,
    state: watch::Sender<SessionState>,
    last_status: Mutex<StatusCode>,
    refresh: Notify,
}

impl Shared {
    fn new(
        store: Arc<dyn CoordinationStore>,
        options: RegistrationOptions,
        settings: SessionSettings,
    ) -> Result<Self, RegistryError> {
        let record = options.encode()?;
        let uid = Uuid::new_v4().simple().to_string();
        let key = instance_key(&settings.prefix, &options, &uid);
        let (state, _) = watch::channel(SessionState::Unregistered);
        Ok(Self {
            options,
            uid,
            key,
            record,
            store,
            settings,
            lease: Mutex::new(None),
            state,
            last_status: Mutex::new(StatusCode::Unknown),
            refresh: Notify::new(),
        })
    }

    async fn register(&self) -> Result<(), BackendError> {
        self.state.send_replace(SessionState::Registering);
        let timeout = self.settings.backend_timeout;

        let lease = call_with_timeout("grant", timeout, self.store.grant(self.options.ttl()))
            .await
            .map_err(|err| self.report("grant", err))?;

        let put = self
            .store
            .put(&self.key, self.record.clone(), Some(lease));
        if let Err(err) = call_with_timeout("put", timeout, put).await {
            // 新租约没有绑定任何记录，直接回收。
            self.revoke_quietly(lease).await;
            return Err(self.report("put", err));
        }

        let previous = self.lease.lock().replace(lease);
        if let Some(previous) = previous.filter(|previous| *previous != lease) {
            self.revoke_quietly(previous).await;
        }
        self.state.send_replace(SessionState::Registered);
        info!(
            service = self.options.service_name(),
            namespace = self.options.namespace(),
            uid = %self.uid,
            lease = %lease,
            key = %self.key,
            "service instance registered"
        );
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), BackendError> {
        let Some(lease) = *self.lease.lock() else {
            return Err(BackendError::unavailable("no lease held"));
        };
        let call = self.store.keep_alive_once(lease);
        match call_with_timeout("keep_alive", self.settings.backend_timeout, call).await {
            Ok(remaining) => {
                debug!(uid = %self.uid, lease = %lease, ?remaining, "lease renewed");
                Ok(())
            }
            Err(err) => Err(self.report("keep_alive", err)),
        }
    }

    async fn deregister(&self) {
        self.state.send_replace(SessionState::Closing);
        let timeout = self.settings.backend_timeout;

        if let Err(err) = call_with_timeout("delete", timeout, self.store.delete(&self.key)).await {
            self.report("delete", err);
        }
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            if let Err(err) = call_with_timeout("revoke", timeout, self.store.revoke(lease)).await {
                self.report("revoke", err);
            }
        }

        self.state.send_replace(SessionState::Unregistered);
        info!(
            service = self.options.service_name(),
            namespace = self.options.namespace(),
            uid = %self.uid,
            key = %self.key,
            "service instance unregistered"
        );
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        let call = self.store.revoke(lease);
        if let Err(err) = call_with_timeout("revoke", self.settings.backend_timeout, call).await {
            self.report("revoke", err);
        }
    }

    /// 记录一轮注册或续约的结果状态，返回是否成功。
    fn settle(&self, result: Result<(), BackendError>) -> bool {
        let error = result.as_ref().err().map(|err| err as &(dyn Error + 'static));
        let status = self.settings.classifier.outcome(error);
        *self.last_status.lock() = status;
        result.is_ok()
    }

    fn report(&self, op: &'static str, err: BackendError) -> BackendError {
        let status = self.settings.classifier.classify(&err);
        warn!(
            service = self.options.service_name(),
            namespace = self.options.namespace(),
            uid = %self.uid,
            op,
            %status,
            error = %err,
            "registration backend call failed"
        );
        err
    }
}

/// 一个服务实例的注册会话。
///
/// # 教案式说明
/// - **意图 (Why)**：会话值拥有后台续约任务，任务的生命周期与值绑定；
/// - **契约 (What)**：
///   - [`RegistrationSession::start`] 必须在 tokio 运行时内调用；
///   - `close().await` 返回时，键已删除、租约已回收（或失败已记录）；
///   - 可以包进 `Arc` 后注册到 [`LifecycleRegistry`](crate::lifecycle::LifecycleRegistry)，
///     `reload` 钩子会触发一次立即重新注册。
pub struct RegistrationSession {
    shared: Arc<Shared>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RegistrationSession {
    /// 编码注册记录并启动续约任务。
    ///
    /// 后端失败不会在这里返回：首次注册同样在后台任务里执行，失败后按节拍重试。
    pub fn start(
        store: Arc<dyn CoordinationStore>,
        options: RegistrationOptions,
        settings: SessionSettings,
    ) -> Result<Self, RegistryError> {
        let shared = Arc::new(Shared::new(store, options, settings)?);
        let span = info_span!(
            "registration_session",
            service = shared.options.service_name(),
            uid = %shared.uid
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(Arc::clone(&shared), shutdown_rx).instrument(span));

        Ok(Self {
            shared,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub fn options(&self) -> &RegistrationOptions {
        &self.shared.options
    }

    pub fn instance_uid(&self) -> &str {
        &self.shared.uid
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// 当前持有的租约；尚未注册成功或已注销时为 `None`。
    pub fn lease_id(&self) -> Option<LeaseId> {
        *self.shared.lease.lock()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// 最近一轮注册或续约的分类结果；首轮结束前为 [`StatusCode::Unknown`]。
    pub fn last_status(&self) -> StatusCode {
        *self.shared.last_status.lock()
    }

    /// 等待会话进入指定状态。
    pub async fn wait_for_state(&self, target: SessionState) {
        let mut rx = self.shared.state.subscribe();
        // Sender 由 `shared` 持有，与 `self` 同生命周期，不会提前关闭。
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// 要求后台任务立即完整重新注册一次。
    pub fn refresh(&self) {
        self.shared.refresh.notify_one();
    }

    /// 发出关闭信号但不等待注销完成。
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }

    /// 关闭会话并等待注销完成；重复调用直接返回。
    pub async fn close(&self) {
        self.shutdown();
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(err) = handle.await {
                warn!(uid = %self.shared.uid, error = %err, "registration task aborted");
            }
        }
    }
}

impl Drop for RegistrationSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RegistrationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationSession")
            .field("key", &self.shared.key)
            .field("lease", &self.lease_id())
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Lifecycle for RegistrationSession {
    fn name(&self) -> &str {
        &self.shared.key
    }

    async fn reload(&self, _config: &RegistryConfig) -> Result<(), RegistryError> {
        self.refresh();
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        RegistrationSession::close(self).await;
        Ok(())
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: oneshot::Receiver<()>) {
    let mut healthy = shared.settle(shared.register().await);

    let period = shared.options.renew_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // 发送端被丢弃同样视为关闭信号。
            _ = &mut shutdown => break,
            _ = shared.refresh.notified() => {
                healthy = shared.settle(shared.register().await);
            }
            _ = ticker.tick() => {
                if healthy {
                    healthy = shared.settle(shared.keep_alive().await);
                }
                if !healthy {
                    healthy = shared.settle(shared.register().await);
                }
            }
        }
    }

    shared.deregister().await;
}
