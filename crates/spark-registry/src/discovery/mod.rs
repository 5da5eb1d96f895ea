//! # discovery：成员快照监听
//!
//! ## 核心意图（Why）
//! - 把“某个逻辑服务当前有哪些实例”变成一条全量快照流，调用方只依赖 [`Discovery`] 接口，
//!   不关心背后是协调存储还是集群编排器；
//! - 快照永远是整体替换，消费者不需要也不应该做增量合并。
//!
//! ## 执行流程（How）
//! - `discover` 同步完成目标解析与首次订阅，随后为每个目标启动一个后台任务；
//! - 任务先列举一次当前成员并推送，之后每收到一条原始变更通知就重新列举、推送一次，不做去抖；
//! - 列举失败只记录 WARN 并跳过本轮；变更流结束后等待 `retry_interval` 重新订阅并重新列举；
//! - 推送通道容量为 1，发送与关闭信号竞争，慢消费者不会卡住关闭流程。
//!
//! ## 契约（What）
//! - [`WatchHandle::close`] 幂等，返回时任务已经退出，快照流随之结束且只结束一次；
//! - 丢弃 [`SnapshotStream`] 同样会让任务在下一次推送时退出。

use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    backend::call_with_timeout,
    config::{DEFAULT_BACKEND_TIMEOUT, DEFAULT_RETRY_INTERVAL, RegistryConfig},
    error::{BackendError, RegistryError},
    instance::{DEFAULT_REGISTRY_PREFIX, Snapshot},
    status::{Classify, DefaultClassifier},
};

pub mod endpoints;
pub mod store;

pub use endpoints::EndpointsDiscovery;
pub use store::StoreDiscovery;

/// 发现后端的能力接口。
///
/// # 教案式说明
/// - **意图 (Why)**：解析桥接按 scheme 选择实现，调用方只看到快照流；
/// - **契约 (What)**：
///   - `scheme` 是拨号地址中的协议名（如 `etcd`、`k8s`）；
///   - `format_target` 把拨号地址的 `namespace` 与 `endpoint` 组合成本后端的目标语法；
///   - `discover` 对无法解析的目标返回 [`RegistryError::InvalidTarget`]，首次订阅失败返回
///     [`RegistryError::Backend`]；成功后快照流的第一个元素是调用时刻已知的成员。
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    fn scheme(&self) -> &'static str;

    fn format_target(&self, namespace: &str, endpoint: &str) -> String;

    async fn discover(&self, target: &str) -> Result<SnapshotWatch, RegistryError>;
}

/// 监听任务的运行参数。
#[derive(Clone)]
pub struct DiscoverySettings {
    prefix: String,
    backend_timeout: Duration,
    retry_interval: Duration,
    classifier: Arc<dyn Classify>,
}

impl DiscoverySettings {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_REGISTRY_PREFIX.to_owned(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            classifier: Arc::new(DefaultClassifier),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new()
            .with_prefix(config.prefix())
            .with_backend_timeout(config.backend_timeout())
            .with_retry_interval(config.retry_interval())
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
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

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DiscoverySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySettings")
            .field("prefix", &self.prefix)
            .field("backend_timeout", &self.backend_timeout)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

/// 全量快照的接收端。
#[derive(Debug)]
pub struct SnapshotStream {
    rx: mpsc::Receiver<Snapshot>,
}

impl SnapshotStream {
    /// 等待下一份快照；监听结束后返回 `None`。
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }
}

impl Stream for SnapshotStream {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        self.rx.poll_recv(cx)
    }
}

/// 监听任务的所有权句柄。
#[derive(Debug)]
pub struct WatchHandle {
    target: String,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WatchHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// 只发出关闭信号。
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }

    /// 发出关闭信号并等待任务退出；重复调用直接返回。
    pub async fn close(&self) {
        self.shutdown();
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(err) = handle.await {
                warn!(watch_target = %self.target, error = %err, "discovery task aborted");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `discover` 的返回值：快照流加上控制句柄。
#[derive(Debug)]
pub struct SnapshotWatch {
    pub stream: SnapshotStream,
    pub handle: WatchHandle,
}

impl SnapshotWatch {
    pub fn into_parts(self) -> (SnapshotStream, WatchHandle) {
        (self.stream, self.handle)
    }

    pub async fn next(&mut self) -> Option<Snapshot> {
        self.stream.next().await
    }

    pub async fn close(&self) {
        self.handle.close().await;
    }
}

/// 变更通知流；元素本身不携带数据。
pub(crate) type ChangeStream = BoxStream<'static, ()>;

/// 单个目标的列举与订阅能力，由具体后端实现。
#[async_trait]
pub(crate) trait SnapshotSource: Send + Sync + 'static {
    async fn subscribe(&self) -> Result<ChangeStream, BackendError>;

    async fn list(&self) -> Result<Snapshot, BackendError>;
}

/// 建立首次订阅并启动监听任务。
pub(crate) async fn start_watch<S: SnapshotSource>(
    source: S,
    target: String,
    settings: DiscoverySettings,
) -> Result<SnapshotWatch, RegistryError> {
    let changes = call_with_timeout("watch", settings.backend_timeout, source.subscribe())
        .await
        .map_err(|err| RegistryError::backend("watch", err))?;

    let (tx, rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let span = info_span!("discovery_watch", watch_target = %target);
    let worker = Worker {
        source,
        target: target.clone(),
        settings,
        tx,
        shutdown: shutdown_rx,
    };
    let task = tokio::spawn(worker.run(changes).instrument(span));

    Ok(SnapshotWatch {
        stream: SnapshotStream { rx },
        handle: WatchHandle {
            target,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        },
    })
}

struct Worker<S> {
    source: S,
    target: String,
    settings: DiscoverySettings,
    tx: mpsc::Sender<Snapshot>,
    shutdown: oneshot::Receiver<()>,
}

/// 任务是否应继续运行。
enum Flow {
    Continue,
    Stop,
}

impl<S: SnapshotSource> Worker<S> {
    async fn run(mut self, mut changes: ChangeStream) {
        if let Flow::Stop = self.relist().await {
            return self.finish();
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut self.shutdown => return self.finish(),
                _ = self.tx.closed() => return self.finish(),
                next = changes.next() => next,
            };

            if next.is_none() {
                warn!(watch_target = %self.target, "change stream ended, resubscribing");
                changes = match self.resubscribe().await {
                    Some(changes) => changes,
                    None => return self.finish(),
                };
            }

            if let Flow::Stop = self.relist().await {
                return self.finish();
            }
        }
    }

    async fn relist(&mut self) -> Flow {
        let call = call_with_timeout("list", self.settings.backend_timeout, self.source.list());
        let result = tokio::select! {
            biased;
            _ = &mut self.shutdown => return Flow::Stop,
            result = call => result,
        };

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.report("list", &err);
                return Flow::Continue;
            }
        };

        let instances = snapshot.len();
        tokio::select! {
            biased;
            _ = &mut self.shutdown => Flow::Stop,
            sent = self.tx.send(snapshot) => match sent {
                Ok(()) => {
                    debug!(watch_target = %self.target, instances, "snapshot delivered");
                    Flow::Continue
                }
                Err(_) => Flow::Stop,
            },
        }
    }

    async fn resubscribe(&mut self) -> Option<ChangeStream> {
        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return None,
                _ = tokio::time::sleep(self.settings.retry_interval) => {}
            }

            let call =
                call_with_timeout("watch", self.settings.backend_timeout, self.source.subscribe());
            let result = tokio::select! {
                biased;
                _ = &mut self.shutdown => return None,
                result = call => result,
            };
            match result {
                Ok(changes) => return Some(changes),
                Err(err) => self.report("watch", &err),
            }
        }
    }

    fn report(&self, op: &'static str, err: &BackendError) {
        let status = self.settings.classifier.classify(err);
        warn!(
            watch_target = %self.target,
            op,
            %status,
            error = %err,
            "discovery backend call failed"
        );
    }

    fn finish(self) {
        info!(watch_target = %self.target, "discovery watch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use futures::channel::mpsc as changes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    /// 可编程的快照源：列举结果来自共享状态，订阅返回测试持有的发送端对应的流。
    #[derive(Clone, Default)]
    struct ScriptedSource {
        members: Arc<Mutex<Snapshot>>,
        senders: Arc<Mutex<Vec<changes::UnboundedSender<()>>>>,
        failing_lists: Arc<AtomicUsize>,
        subscriptions: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn set(&self, members: &[&str]) {
            *self.members.lock() = members.iter().map(|addr| Instance::new(*addr)).collect();
        }

        fn notify(&self) {
            for tx in self.senders.lock().iter() {
                let _ = tx.unbounded_send(());
            }
        }

        fn hang_up(&self) {
            self.senders.lock().clear();
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn subscribe(&self) -> Result<ChangeStream, BackendError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = changes::unbounded();
            self.senders.lock().push(tx);
            Ok(rx.boxed())
        }

        async fn list(&self) -> Result<Snapshot, BackendError> {
            let failing = self
                .failing_lists
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BackendError::unavailable("list refused"));
            }
            Ok(self.members.lock().clone())
        }
    }

    fn addresses(snapshot: &Snapshot) -> Vec<&str> {
        snapshot.iter().map(|i| i.address.as_str()).collect()
    }

    #[tokio::test]
    async fn first_snapshot_is_current_membership_then_one_per_event() {
        let source = ScriptedSource::default();
        source.set(&["a:1", "b:1"]);
        let mut watch = start_watch(source.clone(), "t".into(), DiscoverySettings::new())
            .await
            .unwrap();

        assert_eq!(addresses(&watch.next().await.unwrap()), vec!["a:1", "b:1"]);

        source.set(&["c:1"]);
        source.notify();
        assert_eq!(addresses(&watch.next().await.unwrap()), vec!["c:1"]);

        watch.close().await;
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn list_failure_is_swallowed() {
        let source = ScriptedSource::default();
        source.set(&["a:1"]);
        source.failing_lists.store(1, Ordering::SeqCst);
        let mut watch = start_watch(source.clone(), "t".into(), DiscoverySettings::new())
            .await
            .unwrap();

        source.notify();
        assert_eq!(addresses(&watch.next().await.unwrap()), vec!["a:1"]);
        assert!(logs_contain("discovery backend call failed"));
        watch.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ended_change_stream_is_resubscribed_after_retry_interval() {
        let source = ScriptedSource::default();
        source.set(&["a:1"]);
        let settings = DiscoverySettings::new().with_retry_interval(Duration::from_secs(5));
        let mut watch = start_watch(source.clone(), "t".into(), settings)
            .await
            .unwrap();
        watch.next().await.unwrap();

        source.set(&["b:1"]);
        source.hang_up();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(source.subscriptions.load(Ordering::SeqCst), 1);

        assert_eq!(addresses(&watch.next().await.unwrap()), vec!["b:1"]);
        assert_eq!(source.subscriptions.load(Ordering::SeqCst), 2);
        watch.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_with_pending_snapshot() {
        let source = ScriptedSource::default();
        source.set(&["a:1"]);
        let watch = start_watch(source.clone(), "t".into(), DiscoverySettings::new())
            .await
            .unwrap();

        // 通道里已有一份未读快照，后续推送会阻塞在发送上。
        source.notify();
        tokio::task::yield_now().await;

        let (mut stream, handle) = watch.into_parts();
        handle.close().await;
        handle.close().await;

        let mut delivered = 0;
        while stream.next().await.is_some() {
            delivered += 1;
        }
        assert!(delivered <= 1);
    }
}
