//! 测试辅助：内存 LocalStore 与脚本化 Transport

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::changes::LocalChangeEntry;
use crate::document::{doc_type, Document, Timestamp};
use crate::error::{DocSyncError, Result};
use crate::storage::LocalStore;
use crate::sync::SyncListEntry;
use crate::transport::{ApiPath, Transport};

/// 内存版 LocalStore
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    docs: Mutex<HashMap<String, Document>>,
    changes: Mutex<Vec<LocalChangeEntry>>,
    sync_state: Mutex<Vec<SyncListEntry>>,
}

impl MemoryLocalStore {
    pub fn document_count(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn persisted_sync_state(&self) -> Vec<SyncListEntry> {
        self.sync_state.lock().clone()
    }

    pub fn changes(&self) -> Vec<LocalChangeEntry> {
        self.changes.lock().clone()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn bulk_upsert(&self, docs: &[Document]) -> Result<()> {
        let mut stored = self.docs.lock();
        for doc in docs {
            if doc.is_delete_cmd() {
                if let Some(target) = &doc.target_id {
                    stored.remove(target);
                }
                continue;
            }
            stored.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.lock().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.docs.lock().remove(id);
        Ok(())
    }

    async fn put_local_change(&self, entry: &LocalChangeEntry) -> Result<()> {
        let mut changes = self.changes.lock();
        match changes.iter_mut().find(|c| c.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => changes.push(entry.clone()),
        }
        Ok(())
    }

    async fn local_changes_for_doc(&self, doc_id: &str) -> Result<Vec<LocalChangeEntry>> {
        Ok(self
            .changes
            .lock()
            .iter()
            .filter(|c| c.doc_id == doc_id)
            .cloned()
            .collect())
    }

    async fn delete_local_change(&self, id: &str) -> Result<()> {
        self.changes.lock().retain(|c| c.id != id);
        Ok(())
    }

    async fn oldest_local_change(&self) -> Result<Option<LocalChangeEntry>> {
        Ok(self.changes.lock().first().cloned())
    }

    async fn local_change_count(&self) -> Result<usize> {
        Ok(self.changes.lock().len())
    }

    async fn load_sync_state(&self) -> Result<Vec<SyncListEntry>> {
        Ok(self.sync_state.lock().clone())
    }

    async fn persist_sync_state(&self, entries: &[SyncListEntry]) -> Result<()> {
        *self.sync_state.lock() = entries.to_vec();
        Ok(())
    }
}

/// 脚本化 Transport：按顺序返回预设响应，并记录每一次调用
///
/// 查询脚本耗尽后返回空结果（`{"docs": []}`）；
/// 修改请求脚本耗尽后按请求 id 返回 accepted。
#[derive(Debug, Default)]
pub struct MockTransport {
    queries: Mutex<VecDeque<Result<Option<Value>>>>,
    changes: Mutex<VecDeque<Result<Option<Value>>>>,
    calls: Mutex<Vec<(ApiPath, Value)>>,
    cancel_on_query: Option<CancellationToken>,
    change_gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次处理查询时取消给定 token（模拟请求途中被取消）
    pub fn cancel_on_query(mut self, token: CancellationToken) -> Self {
        self.cancel_on_query = Some(token);
        self
    }

    /// 修改请求需要先从闸门获取许可才会返回
    pub fn with_change_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.change_gate = Some(gate);
        self
    }

    pub fn push_query(&self, response: Value) {
        self.queries.lock().push_back(Ok(Some(response)));
    }

    pub fn push_query_raw(&self, response: Option<Value>) {
        self.queries.lock().push_back(Ok(response));
    }

    pub fn push_query_error(&self, message: &str) {
        self.queries
            .lock()
            .push_back(Err(DocSyncError::Transport(message.to_string())));
    }

    pub fn push_change(&self, response: Value) {
        self.changes.lock().push_back(Ok(Some(response)));
    }

    pub fn push_change_error(&self, message: &str) {
        self.changes
            .lock()
            .push_back(Err(DocSyncError::Transport(message.to_string())));
    }

    pub fn calls(&self) -> Vec<(ApiPath, Value)> {
        self.calls.lock().clone()
    }

    pub fn query_bodies(&self) -> Vec<Value> {
        self.bodies(ApiPath::Query)
    }

    pub fn change_bodies(&self) -> Vec<Value> {
        self.bodies(ApiPath::ChangeRequest)
    }

    fn bodies(&self, path: ApiPath) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| *p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, path: ApiPath, body: Value) -> Result<Option<Value>> {
        self.calls.lock().push((path, body.clone()));
        match path {
            ApiPath::Query => {
                if let Some(token) = &self.cancel_on_query {
                    token.cancel();
                }
                let scripted = self.queries.lock().pop_front();
                scripted.unwrap_or_else(|| Ok(Some(docs_response(&[]))))
            }
            ApiPath::ChangeRequest => {
                if let Some(gate) = &self.change_gate {
                    gate.acquire()
                        .await
                        .map_err(|e| DocSyncError::Other(e.to_string()))?
                        .forget();
                }
                let scripted = self.changes.lock().pop_front();
                scripted.unwrap_or_else(|| {
                    Ok(Some(json!({ "id": body["id"].clone(), "ack": "accepted" })))
                })
            }
        }
    }
}

/// `{"docs": [...]}`
pub fn docs_response(docs: &[Document]) -> Value {
    json!({ "docs": docs })
}

/// 按给定的更新时间生成 post 文档（id 取自时间戳）
pub fn post_docs(times: &[Timestamp]) -> Vec<Document> {
    times
        .iter()
        .map(|t| {
            Document::new(format!("post-{}", t), doc_type::POST)
                .with_updated_time(*t)
                .with_member_of(["public"])
        })
        .collect()
}
