//! 事件系统
//!
//! 同步与本地修改管线的进度通过 broadcast 通道通知 UI 层。
//! 没有订阅者时发送失败属于正常情况。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::document::{now_millis, Timestamp};
use crate::transport::AckStatus;

/// SDK 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 某一列开始同步
    ColumnSyncStarted {
        chunk_type: String,
        member_of: Vec<String>,
        languages: Option<Vec<String>>,
        timestamp: Timestamp,
    },
    /// 某一列本轮同步完成
    ColumnSyncFinished {
        chunk_type: String,
        member_of: Vec<String>,
        block_start: Timestamp,
        block_end: Timestamp,
        eof: bool,
        timestamp: Timestamp,
    },
    /// 一次批量拉取写入了文档
    DocumentsUpdated {
        chunk_type: String,
        count: usize,
        timestamp: Timestamp,
    },
    /// 同步失败（整列中止）
    SyncFailed {
        doc_type: String,
        error: String,
        timestamp: Timestamp,
    },
    /// 本地修改入队
    LocalChangeQueued {
        change_id: String,
        doc_id: String,
        timestamp: Timestamp,
    },
    /// 本地修改得到服务端确认
    LocalChangeAcknowledged {
        change_id: String,
        doc_id: String,
        ack: AckStatus,
        timestamp: Timestamp,
    },
    /// 本地修改推送失败（等待下一次重连/入队再试）
    LocalChangeFailed {
        change_id: String,
        doc_id: String,
        error: String,
        timestamp: Timestamp,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ColumnSyncStarted { .. } => "column_sync_started",
            SyncEvent::ColumnSyncFinished { .. } => "column_sync_finished",
            SyncEvent::DocumentsUpdated { .. } => "documents_updated",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::LocalChangeQueued { .. } => "local_change_queued",
            SyncEvent::LocalChangeAcknowledged { .. } => "local_change_acknowledged",
            SyncEvent::LocalChangeFailed { .. } => "local_change_failed",
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            SyncEvent::ColumnSyncStarted { timestamp, .. }
            | SyncEvent::ColumnSyncFinished { timestamp, .. }
            | SyncEvent::DocumentsUpdated { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. }
            | SyncEvent::LocalChangeQueued { timestamp, .. }
            | SyncEvent::LocalChangeAcknowledged { timestamp, .. }
            | SyncEvent::LocalChangeFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件统计
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub last_event_time: Option<Timestamp>,
}

/// 事件管理器
#[derive(Debug)]
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    stats: Arc<RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件构造辅助
pub mod event_builders {
    use super::*;

    pub fn column_started(
        chunk_type: &str,
        member_of: &[String],
        languages: Option<&[String]>,
    ) -> SyncEvent {
        SyncEvent::ColumnSyncStarted {
            chunk_type: chunk_type.to_string(),
            member_of: member_of.to_vec(),
            languages: languages.map(|l| l.to_vec()),
            timestamp: now_millis(),
        }
    }

    pub fn column_finished(
        chunk_type: &str,
        member_of: &[String],
        block_start: Timestamp,
        block_end: Timestamp,
        eof: bool,
    ) -> SyncEvent {
        SyncEvent::ColumnSyncFinished {
            chunk_type: chunk_type.to_string(),
            member_of: member_of.to_vec(),
            block_start,
            block_end,
            eof,
            timestamp: now_millis(),
        }
    }

    pub fn documents_updated(chunk_type: &str, count: usize) -> SyncEvent {
        SyncEvent::DocumentsUpdated {
            chunk_type: chunk_type.to_string(),
            count,
            timestamp: now_millis(),
        }
    }

    pub fn sync_failed(doc_type: &str, error: impl ToString) -> SyncEvent {
        SyncEvent::SyncFailed {
            doc_type: doc_type.to_string(),
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn change_queued(change_id: &str, doc_id: &str) -> SyncEvent {
        SyncEvent::LocalChangeQueued {
            change_id: change_id.to_string(),
            doc_id: doc_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn change_acknowledged(change_id: &str, doc_id: &str, ack: AckStatus) -> SyncEvent {
        SyncEvent::LocalChangeAcknowledged {
            change_id: change_id.to_string(),
            doc_id: doc_id.to_string(),
            ack,
            timestamp: now_millis(),
        }
    }

    pub fn change_failed(change_id: &str, doc_id: &str, error: impl ToString) -> SyncEvent {
        SyncEvent::LocalChangeFailed {
            change_id: change_id.to_string(),
            doc_id: doc_id.to_string(),
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }
}
