//! DocSync SDK 主入口
//!
//! 分层初始化：存储 → 同步区间 → 网络监控 → 事件 → 同步编排 → 本地修改管线。
//! `start()` 之后后台运行两个任务：本地修改推送与定时同步。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::access::AccessControl;
use crate::changes::{ChangeQueue, LocalChangeEntry, UpsertOptions};
use crate::config::{DocTypeConfig, SyncConfig};
use crate::document::{is_content_type, Document};
use crate::error::{DocSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::storage::{LocalStore, StorageManager};
use crate::sync::{
    BatchFetcher, BatchSettings, ChunkStore, ColumnOutcome, SharedChunkStore, SyncJob, SyncListEntry,
    SyncOptions, SyncRunner, SyncScheduler,
};
use crate::transport::{HttpTransport, Transport};
use crate::version;

/// 一轮完整同步的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub columns: usize,
    pub eof_columns: usize,
    /// 被取消或遇到临时失败的列
    pub incomplete_columns: usize,
}

impl SyncSummary {
    pub fn is_complete(&self) -> bool {
        self.incomplete_columns == 0
    }

    fn record(&mut self, outcomes: &[ColumnOutcome]) {
        for outcome in outcomes {
            self.columns += 1;
            match outcome.result {
                Some(result) if result.eof => self.eof_columns += 1,
                Some(_) => {}
                None => self.incomplete_columns += 1,
            }
        }
    }
}

/// 同步编排：持有 runner、权限来源与当前的取消令牌
#[derive(Debug)]
struct SyncCoordinator {
    runner: SyncRunner,
    access: Arc<dyn AccessControl>,
    doc_types: Vec<DocTypeConfig>,
    include_delete_cmds: bool,
    cancel: Mutex<CancellationToken>,
}

impl SyncCoordinator {
    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// 取消进行中的同步；之后的同步使用新的令牌
    fn cancel(&self, parent: &CancellationToken) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = parent.child_token();
    }

    fn options_for(&self, doc_type: &DocTypeConfig) -> SyncOptions {
        let mut options = SyncOptions::new(
            doc_type.doc_type.clone(),
            self.access
                .accessible_groups(&doc_type.doc_type, &doc_type.permission),
        )
        .include_delete_cmds(self.include_delete_cmds);
        if let Some(subtype) = &doc_type.subtype {
            options = options.with_subtype(subtype.clone());
        }
        if is_content_type(&doc_type.doc_type) {
            options = options.with_languages(self.access.permitted_languages());
        }
        options
    }

    async fn sync(&self, options: &SyncOptions) -> Result<Vec<ColumnOutcome>> {
        self.runner.sync(options, &self.token()).await
    }

    async fn sync_all(&self) -> Result<SyncSummary> {
        let cancel = self.token();
        let mut summary = SyncSummary::default();
        let mut first_error = None;

        for doc_type in &self.doc_types {
            if cancel.is_cancelled() {
                info!("同步已取消，跳过剩余类型");
                summary.incomplete_columns += 1;
                break;
            }
            let options = self.options_for(doc_type);
            match self.runner.sync(&options, &cancel).await {
                Ok(outcomes) => summary.record(&outcomes),
                Err(e) => {
                    error!("❌ {} 同步失败: {}", doc_type.doc_type, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

#[async_trait]
impl SyncJob for SyncCoordinator {
    async fn run_once(&self) -> Result<bool> {
        Ok(self.sync_all().await?.is_complete())
    }
}

/// DocSync SDK
#[derive(Debug)]
pub struct DocSyncSDK {
    config: SyncConfig,
    storage: Arc<StorageManager>,
    chunks: SharedChunkStore,
    coordinator: Arc<SyncCoordinator>,
    change_queue: Arc<ChangeQueue>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DocSyncSDK {
    /// 使用配置中的 api_url 构建 HTTP 传输并初始化
    pub async fn initialize_http(config: SyncConfig, access: Arc<dyn AccessControl>) -> Result<Arc<Self>> {
        config.validate_for_http()?;
        let transport = HttpTransport::new(
            &config.http_client_config,
            &config.api_url,
            config.auth_token.clone(),
        )?;
        Self::initialize(config, Arc::new(transport), access).await
    }

    pub async fn initialize(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        access: Arc<dyn AccessControl>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 DocSyncSDK... {}", version::version_summary());
        config.validate()?;

        // === 第1层：存储管理器 ===
        let storage = Arc::new(StorageManager::new(&config.data_dir).await?);
        let store: Arc<dyn LocalStore> = storage.clone();

        // === 第2层：同步区间 ===
        let chunks = ChunkStore::load(store.as_ref(), config.tolerance_ms)
            .await?
            .into_shared();

        // === 第3层：网络监控与事件 ===
        let network = Arc::new(NetworkMonitor::new());
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：同步编排 ===
        let fetcher = BatchFetcher::new(
            transport.clone(),
            store.clone(),
            chunks.clone(),
            BatchSettings {
                limit: config.batch_limit,
                index_hint: config.index_hint.clone(),
                delete_cmd_index_hint: config.delete_cmd_index_hint.clone(),
                cms: config.cms,
            },
        )
        .with_events(events.clone());
        let runner = SyncRunner::new(fetcher).with_events(events.clone());
        let shutdown = CancellationToken::new();
        let coordinator = Arc::new(SyncCoordinator {
            runner,
            access,
            doc_types: config.doc_types.clone(),
            include_delete_cmds: config.include_delete_cmds,
            cancel: Mutex::new(shutdown.child_token()),
        });

        // === 第5层：本地修改管线 ===
        let change_queue = Arc::new(ChangeQueue::new(store, transport).with_events(events.clone()));

        info!("✅ DocSyncSDK 初始化完成");
        Ok(Arc::new(Self {
            config,
            storage,
            chunks,
            coordinator,
            change_queue,
            network,
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 启动后台任务（本地修改推送 + 定时同步），重复调用无效
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(DocSyncError::Other("SDK 已关闭".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("DocSyncSDK 已启动，忽略重复调用");
            return Ok(());
        }

        self.network.start().await?;

        let queue_task = tokio::spawn(
            self.change_queue
                .clone()
                .run(self.network.clone(), self.shutdown.clone()),
        );

        let scheduler = SyncScheduler::new(
            Duration::from_secs(self.config.sync_interval_secs),
            self.config.retry_delay_ms,
            self.config.retry_jitter,
        );
        let job: Arc<dyn SyncJob> = self.coordinator.clone();
        let shutdown = self.shutdown.clone();
        let sync_task = tokio::spawn(async move { scheduler.run(job, shutdown).await });

        self.tasks.lock().extend([queue_task, sync_task]);
        info!("🚀 DocSyncSDK 后台任务已启动");
        Ok(())
    }

    /// 同步单个类型
    pub async fn sync(&self, options: &SyncOptions) -> Result<Vec<ColumnOutcome>> {
        self.coordinator.sync(options).await
    }

    /// 按配置的文档类型与当前授权同步全部
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        self.coordinator.sync_all().await
    }

    /// 取消进行中的同步（已提交的状态保持有效，之后可以继续同步）
    pub fn cancel(&self) {
        info!("取消进行中的同步");
        self.coordinator.cancel(&self.shutdown);
    }

    /// 本地修改：立即写入本地，并排队等待推送
    pub async fn upsert(&self, doc: Document, options: UpsertOptions) -> Result<LocalChangeEntry> {
        self.change_queue.upsert(doc, options).await
    }

    /// 手动推送一轮本地修改
    pub async fn push_local_changes(&self) -> Result<usize> {
        if !self.network.is_connected().await {
            return Err(DocSyncError::NotConnected);
        }
        self.change_queue.process_queue().await
    }

    pub async fn pending_changes(&self) -> Result<usize> {
        self.change_queue.pending_count().await
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.storage.get(id).await
    }

    /// 由平台层通知网络状态
    pub async fn set_connected(&self, connected: bool) {
        let status = if connected {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };
        self.network.set_status(status).await;
        self.change_queue.set_connected(connected);
    }

    pub fn network(&self) -> Arc<NetworkMonitor> {
        self.network.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn sync_state(&self) -> Vec<SyncListEntry> {
        self.chunks.lock().snapshot()
    }

    /// 关闭：停止后台任务，持久化同步区间并刷盘
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 DocSyncSDK...");
        self.coordinator.token().cancel();
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("后台任务退出异常: {}", e);
            }
        }
        self.network.stop().await;

        ChunkStore::persist(&self.chunks, self.storage.as_ref()).await?;
        self.storage.flush().await?;
        info!("DocSyncSDK 关闭完成");
        Ok(())
    }
}
