//! 本地修改管线
//!
//! `upsert` 先写本地再入队；`process_queue` 按入队顺序一次推送一条，
//! 拿到服务端确认后才推送下一条（single-flight）。
//!
//! 推送锁默认加锁：上线解锁，离线重新加锁；推送途中同样视为加锁，
//! 直到确认处理完毕。
//!
//! 入队（含覆盖判断）与「取队首并标记推送中」互斥，
//! 覆盖模式因此不会改写已经取出推送的条目。

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::document::{now_millis, Document, Timestamp};
use crate::error::{DocSyncError, Result};
use crate::events::{event_builders, EventManager};
use crate::network::NetworkMonitor;
use crate::storage::LocalStore;
use crate::transport::{AckStatus, ApiPath, ChangeAck, ChangeRequest, Transport};

/// 本地修改状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    /// 等待推送
    Queued,
    /// 推送中，等待确认
    Pushing,
    /// 推送失败（网络），等待下一次触发
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Queued => "queued",
            ChangeStatus::Pushing => "pushing",
            ChangeStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(ChangeStatus::Queued),
            "pushing" => Some(ChangeStatus::Pushing),
            "failed" => Some(ChangeStatus::Failed),
            _ => None,
        }
    }
}

/// 待服务端确认的本地修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChangeEntry {
    pub id: String,
    pub doc_id: String,
    pub doc: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChangeStatus>,
    pub created_at: Timestamp,
}

impl LocalChangeEntry {
    pub fn new(doc: Document) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            doc_id: doc.id.clone(),
            doc,
            status: Some(ChangeStatus::Queued),
            created_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    /// 替换同一文档尚未推送的修改，而不是追加一条
    pub overwrite_local_changes: bool,
}

impl UpsertOptions {
    pub fn overwrite() -> Self {
        Self {
            overwrite_local_changes: true,
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    online: bool,
    in_flight: Option<String>,
}

/// 推送锁
#[derive(Debug, Default)]
pub struct PushLock {
    state: Mutex<LockState>,
}

impl PushLock {
    /// 在线且没有推送中的修改时获取锁
    fn try_acquire(&self) -> Option<PushGuard<'_>> {
        let mut state = self.state.lock();
        if !state.online || state.in_flight.is_some() {
            return None;
        }
        state.in_flight = Some(String::new());
        Some(PushGuard { lock: self })
    }

    pub fn on_reconnect(&self) {
        self.state.lock().online = true;
    }

    pub fn on_disconnect(&self) {
        self.state.lock().online = false;
    }

    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        !state.online || state.in_flight.is_some()
    }

    fn in_flight(&self) -> Option<String> {
        self.state.lock().in_flight.clone().filter(|id| !id.is_empty())
    }
}

/// 持有期间视为推送中；drop 时释放
struct PushGuard<'a> {
    lock: &'a PushLock,
}

impl PushGuard<'_> {
    fn set_entry(&self, id: &str) {
        self.lock.state.lock().in_flight = Some(id.to_string());
    }
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.lock().in_flight = None;
    }
}

/// 本地修改队列
#[derive(Debug)]
pub struct ChangeQueue {
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn Transport>,
    lock: PushLock,
    /// 入队与取队首互斥
    claim: AsyncMutex<()>,
    notify: Notify,
    events: Option<Arc<EventManager>>,
}

impl ChangeQueue {
    pub fn new(store: Arc<dyn LocalStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            lock: PushLock::default(),
            claim: AsyncMutex::new(()),
            notify: Notify::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    /// 写入本地并入队
    pub async fn upsert(&self, doc: Document, options: UpsertOptions) -> Result<LocalChangeEntry> {
        if doc.id.is_empty() {
            return Err(DocSyncError::InvalidArgument("文档 _id 不能为空".to_string()));
        }
        self.store.bulk_upsert(std::slice::from_ref(&doc)).await?;

        let entry = {
            let _claim = self.claim.lock().await;
            let entry = match self.replaceable_entry(&doc, options).await? {
                Some(entry) => entry,
                None => LocalChangeEntry::new(doc),
            };
            self.store.put_local_change(&entry).await?;
            entry
        };
        debug!("本地修改入队: {} (doc {})", entry.id, entry.doc_id);

        if let Some(events) = &self.events {
            events
                .emit(event_builders::change_queued(&entry.id, &entry.doc_id))
                .await;
        }
        self.notify.notify_one();
        Ok(entry)
    }

    /// 覆盖模式：复用该文档最早的一条未推送修改，删除其余的
    async fn replaceable_entry(
        &self,
        doc: &Document,
        options: UpsertOptions,
    ) -> Result<Option<LocalChangeEntry>> {
        if !options.overwrite_local_changes {
            return Ok(None);
        }
        let in_flight = self.lock.in_flight();
        let mut pending = self
            .store
            .local_changes_for_doc(&doc.id)
            .await?
            .into_iter()
            .filter(|e| Some(&e.id) != in_flight.as_ref());

        let Some(mut keep) = pending.next() else {
            return Ok(None);
        };
        for stale in pending {
            self.store.delete_local_change(&stale.id).await?;
        }
        keep.doc = doc.clone();
        keep.status = Some(ChangeStatus::Queued);
        Ok(Some(keep))
    }

    pub fn set_connected(&self, connected: bool) {
        if connected {
            self.lock.on_reconnect();
            self.notify.notify_one();
        } else {
            self.lock.on_disconnect();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.store.local_change_count().await
    }

    /// 依次推送队列中的修改，返回本次处理的确认数
    ///
    /// 离线、队列为空或已有推送在途时立即返回。
    pub async fn process_queue(&self) -> Result<usize> {
        let mut acknowledged = 0;
        loop {
            let Some(guard) = self.lock.try_acquire() else {
                break;
            };
            let entry = {
                let _claim = self.claim.lock().await;
                let Some(entry) = self.store.oldest_local_change().await? else {
                    break;
                };
                guard.set_entry(&entry.id);
                entry
            };
            self.push_entry(entry).await?;
            drop(guard);
            acknowledged += 1;
        }
        Ok(acknowledged)
    }

    async fn push_entry(&self, entry: LocalChangeEntry) -> Result<()> {
        let mut pushing = entry.clone();
        pushing.status = Some(ChangeStatus::Pushing);
        self.store.put_local_change(&pushing).await?;

        let request = ChangeRequest {
            id: entry.id.clone(),
            doc: entry.doc.clone(),
        };
        let body = serde_json::to_value(&request)?;
        debug!("推送本地修改: {} (doc {})", entry.id, entry.doc_id);

        let response = match self.transport.post(ApiPath::ChangeRequest, body).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return self
                    .mark_failed(entry, DocSyncError::Transport("修改请求返回空响应".to_string()))
                    .await
            }
            Err(e) => return self.mark_failed(entry, e).await,
        };
        let ack: ChangeAck = match serde_json::from_value(response) {
            Ok(ack) => ack,
            Err(e) => {
                let err = DocSyncError::MalformedResponse(format!("无法解析修改确认: {}", e));
                return self.mark_failed(entry, err).await;
            }
        };
        self.apply_ack(&entry, ack).await
    }

    async fn mark_failed(&self, mut entry: LocalChangeEntry, err: DocSyncError) -> Result<()> {
        error!("❌ 推送本地修改失败: {} (doc {}): {}", entry.id, entry.doc_id, err);
        entry.status = Some(ChangeStatus::Failed);
        self.store.put_local_change(&entry).await?;
        if let Some(events) = &self.events {
            events
                .emit(event_builders::change_failed(&entry.id, &entry.doc_id, &err))
                .await;
        }
        Err(err)
    }

    /// 处理确认：无论结果如何，待确认条目都会被删除
    async fn apply_ack(&self, entry: &LocalChangeEntry, ack: ChangeAck) -> Result<()> {
        if ack.id != entry.id {
            warn!("确认 id 不匹配: 期望 {}, 收到 {}", entry.id, ack.id);
        }
        match ack.ack {
            AckStatus::Accepted => {
                debug!("✅ 修改已接受: {}", entry.id);
            }
            AckStatus::Rejected => match ack.docs.as_deref() {
                Some(docs) if !docs.is_empty() => {
                    info!("修改被拒绝，使用服务端版本覆盖: {}", entry.doc_id);
                    self.store.bulk_upsert(docs).await?;
                }
                _ => {
                    info!("修改被拒绝且服务端无此文档，删除本地文档: {}", entry.doc_id);
                    self.store.delete(&entry.doc_id).await?;
                }
            },
        }
        self.store.delete_local_change(&entry.id).await?;

        if let Some(events) = &self.events {
            events
                .emit(event_builders::change_acknowledged(&entry.id, &entry.doc_id, ack.ack))
                .await;
        }
        Ok(())
    }

    async fn process_and_log(&self) {
        match self.process_queue().await {
            Ok(0) => {}
            Ok(count) => debug!("本轮处理 {} 条本地修改", count),
            Err(e) => warn!("本地修改推送中断，等待下一次触发: {}", e),
        }
    }

    /// 对网络状态与入队事件做出反应，直到 `shutdown` 被取消
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, network: Arc<NetworkMonitor>, shutdown: CancellationToken) {
        let mut network_rx = network.subscribe();
        self.set_connected(network.is_connected().await);
        info!("📤 本地修改管线已启动");

        loop {
            self.process_and_log().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = network_rx.recv() => match event {
                    Ok(event) => self.set_connected(event.new_status.is_connected()),
                    Err(RecvError::Lagged(_)) => self.set_connected(network.is_connected().await),
                    Err(RecvError::Closed) => break,
                },
                _ = self.notify.notified() => {}
            }
        }
        info!("本地修改管线已停止");
    }
}
