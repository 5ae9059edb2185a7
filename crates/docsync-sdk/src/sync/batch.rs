//! BatchFetcher - 单列的「拉取 → 写入 → 合并 → 继续」循环
//!
//! 每轮：计算窗口、查询服务端、写入本地、追加 chunk 并合并；
//! 未到底（eof）则以续拉窗口继续，直到到底或被取消。
//! 取消在每次网络请求前后检查，已提交的状态始终可以安全续跑。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk::{chunk_type, ChunkKey, SyncListEntry};
use super::chunk_store::{ChunkStore, SharedChunkStore, SyncWindow};
use super::merge::{merge_horizontal, merge_vertical, ChunkRange};
use super::query::SyncQuery;
use crate::document::{doc_type, is_content_type, Document, GroupId, LanguageCode, Timestamp, MAX_TIMESTAMP};
use crate::error::{DocSyncError, Result};
use crate::events::{event_builders, EventManager};
use crate::storage::LocalStore;
use crate::transport::{ApiPath, Transport};

/// 一个同步单元（列）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncUnit {
    pub doc_type: String,
    pub subtype: Option<String>,
    pub member_of: Vec<GroupId>,
    /// 仅内容类型有语言
    pub languages: Option<Vec<LanguageCode>>,
}

impl SyncUnit {
    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(
            &self.doc_type,
            self.subtype.as_deref(),
            &self.member_of,
            self.languages.as_deref(),
        )
    }

    /// 对应的墓碑列：`{type: deleteCmd, subtype: <本列 chunk 类型>}`，范围不变
    pub fn delete_cmd_unit(&self) -> SyncUnit {
        SyncUnit {
            doc_type: doc_type::DELETE_CMD.to_string(),
            subtype: Some(chunk_type(&self.doc_type, self.subtype.as_deref())),
            member_of: self.member_of.clone(),
            languages: self.languages.clone(),
        }
    }

    /// 查询用的 subtype
    ///
    /// 墓碑列的 subtype 是父列的 chunk 类型（如 `content:post`），
    /// 服务端只按父文档类型过滤（`docType = content`）。
    pub fn query_subtype(&self) -> Option<&str> {
        match self.subtype.as_deref() {
            Some(sub) if self.doc_type == doc_type::DELETE_CMD => sub.split(':').next(),
            other => other,
        }
    }
}

/// 一列本轮同步的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub eof: bool,
    pub block_start: Timestamp,
    pub block_end: Timestamp,
    /// 本轮从空窗口开始（该列此前没有任何 chunk）
    pub first_sync: bool,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub limit: usize,
    pub index_hint: String,
    pub delete_cmd_index_hint: String,
    pub cms: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            limit: 100,
            index_hint: "sync-type-updatedTimeUtc".to_string(),
            delete_cmd_index_hint: "sync-deleteCmd-updatedTimeUtc".to_string(),
            cms: false,
        }
    }
}

/// 追加 chunk 并纵向合并
///
/// `recombine` 为 true 时，到底后再做横向合并并以其区间为准。
/// 同类型的其他列可能仍在拉取中时必须为 false，由调用方在所有列结束后统一横向合并。
pub(crate) fn commit_chunk(
    chunks: &mut ChunkStore,
    key: &ChunkKey,
    entry: SyncListEntry,
    recombine: bool,
) -> ChunkRange {
    let fallback = ChunkRange::from(&entry);
    chunks.push(entry);
    let merged = merge_vertical(chunks, key).unwrap_or(fallback);
    if recombine && merged.eof {
        if let Some(horizontal) = merge_horizontal(chunks, &key.chunk_type) {
            return horizontal;
        }
    }
    merged
}

/// 根据本轮返回的文档计算要追加的 chunk
///
/// 返回数少于 limit 说明窗口已查尽，窗口的有限边界本身就是已同步的范围。
/// 空结果且窗口下界为 0 时是占位 chunk（`block_start == 0`），只用于传递 eof。
fn chunk_for_page(key: &ChunkKey, window: SyncWindow, docs: &[Document], limit: usize) -> SyncListEntry {
    let exhausted = docs.len() < limit;
    let bounded_top = window.block_start != MAX_TIMESTAMP;

    if docs.is_empty() {
        if bounded_top && !window.reaches_beginning() {
            return SyncListEntry::new(key, window.block_start, window.block_end, false);
        }
        return SyncListEntry::new(key, 0, 0, window.reaches_beginning());
    }

    let newest = docs.iter().map(|d| d.updated_time_utc).max().unwrap_or(0);
    let oldest = docs.iter().map(|d| d.updated_time_utc).min().unwrap_or(0);
    let block_start = if bounded_top { window.block_start.max(newest) } else { newest };
    let block_end = if exhausted && !window.reaches_beginning() {
        window.block_end.min(oldest)
    } else {
        oldest
    };
    SyncListEntry::new(key, block_start, block_end, exhausted)
}

/// 校验响应结构并取出文档；`docs` 不是数组属于致命错误
fn parse_docs(response: &serde_json::Value) -> Result<Vec<Document>> {
    let docs = response
        .get("docs")
        .and_then(|d| d.as_array())
        .ok_or_else(|| DocSyncError::MalformedResponse("docs 字段不是数组".to_string()))?;
    docs.iter()
        .map(|raw| {
            serde_json::from_value::<Document>(raw.clone())
                .map_err(|e| DocSyncError::MalformedResponse(format!("无法解析文档: {}", e)))
        })
        .collect()
}

fn log_server_warnings(response: &serde_json::Value) {
    if let Some(warning) = response.get("warning").and_then(|w| w.as_str()) {
        warn!("⚠️ 服务端警告: {}", warning);
    }
    if let Some(warnings) = response.get("warnings").and_then(|w| w.as_array()) {
        for warning in warnings.iter().filter_map(|w| w.as_str()) {
            warn!("⚠️ 服务端警告: {}", warning);
        }
    }
}

/// 批量拉取器
#[derive(Debug, Clone)]
pub struct BatchFetcher {
    transport: Arc<dyn Transport>,
    store: Arc<dyn LocalStore>,
    chunks: SharedChunkStore,
    events: Option<Arc<EventManager>>,
    settings: BatchSettings,
}

impl BatchFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn LocalStore>,
        chunks: SharedChunkStore,
        settings: BatchSettings,
    ) -> Self {
        Self {
            transport,
            store,
            chunks,
            events: None,
            settings,
        }
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn chunks(&self) -> &SharedChunkStore {
        &self.chunks
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// 同步一列
    ///
    /// - `Ok(Some(result))`：本轮完成（到底或追平）
    /// - `Ok(None)`：被取消，或服务端返回空响应（临时失败，稍后重试）
    /// - `Err(MalformedResponse)`：响应格式非法，本次调用未修改任何状态
    pub async fn sync_batch(
        &self,
        unit: &SyncUnit,
        initial_sync: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<BatchResult>> {
        self.fetch_column(unit, initial_sync, cancel, true).await
    }

    /// 与 `sync_batch` 相同，但到底后不做横向合并（同类型多列并发时使用）
    pub(crate) async fn sync_batch_deferred(
        &self,
        unit: &SyncUnit,
        initial_sync: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<BatchResult>> {
        self.fetch_column(unit, initial_sync, cancel, false).await
    }

    async fn fetch_column(
        &self,
        unit: &SyncUnit,
        initial_sync: bool,
        cancel: &CancellationToken,
        recombine: bool,
    ) -> Result<Option<BatchResult>> {
        let key = unit.key();
        let mut initial_sync = initial_sync;
        let mut first_sync: Option<bool> = None;

        loop {
            if cancel.is_cancelled() {
                debug!("同步已取消: {}", key.chunk_type);
                return Ok(None);
            }

            let window = self.chunks.lock().calc_chunk(&key, initial_sync);
            let first = *first_sync.get_or_insert(window.reaches_beginning());

            let use_index = if unit.doc_type == doc_type::DELETE_CMD {
                &self.settings.delete_cmd_index_hint
            } else {
                &self.settings.index_hint
            };
            let query = SyncQuery {
                doc_type: &unit.doc_type,
                subtype: unit.query_subtype(),
                member_of: &key.member_of,
                languages: if is_content_type(&unit.doc_type) {
                    key.languages.as_deref()
                } else {
                    None
                },
                window,
                limit: self.settings.limit,
                use_index,
                cms: self.settings.cms,
            }
            .to_json();

            if cancel.is_cancelled() {
                return Ok(None);
            }
            debug!(
                "拉取 {} {:?} 窗口 [{}, {}]",
                key.chunk_type, key.member_of, window.block_end, window.block_start
            );
            let response = self.transport.post(ApiPath::Query, query).await?;
            if cancel.is_cancelled() {
                debug!("请求返回后发现已取消，丢弃结果: {}", key.chunk_type);
                return Ok(None);
            }

            let Some(response) = response else {
                warn!("⚠️ {} 查询返回空响应，稍后重试", key.chunk_type);
                return Ok(None);
            };
            let docs = parse_docs(&response)?;
            log_server_warnings(&response);

            if !docs.is_empty() {
                self.store.bulk_upsert(&docs).await?;
                if let Some(events) = &self.events {
                    events
                        .emit(event_builders::documents_updated(&key.chunk_type, docs.len()))
                        .await;
                }
            }

            let entry = chunk_for_page(&key, window, &docs, self.settings.limit);
            let range = {
                let mut chunks = self.chunks.lock();
                commit_chunk(&mut chunks, &key, entry, recombine)
            };
            ChunkStore::persist(&self.chunks, self.store.as_ref()).await?;

            debug!(
                "{} 本批 {} 条 -> [{}, {}] eof={}",
                key.chunk_type,
                docs.len(),
                range.block_end,
                range.block_start,
                range.eof
            );

            if range.eof {
                info!(
                    "✅ {} {:?} 已同步到底 [{}, {}]",
                    key.chunk_type, key.member_of, range.block_end, range.block_start
                );
                return Ok(Some(BatchResult {
                    eof: true,
                    block_start: range.block_start,
                    block_end: range.block_end,
                    first_sync: first,
                }));
            }

            // 续拉：填补最新 chunk 之下的缺口
            initial_sync = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{docs_response, post_docs, MemoryLocalStore, MockTransport};
    use serde_json::json;

    fn unit(groups: &[&str]) -> SyncUnit {
        SyncUnit {
            doc_type: "post".into(),
            subtype: None,
            member_of: groups.iter().map(|g| g.to_string()).collect(),
            languages: None,
        }
    }

    fn fetcher(transport: Arc<MockTransport>, store: Arc<MemoryLocalStore>, limit: usize) -> BatchFetcher {
        BatchFetcher::new(
            transport,
            store,
            ChunkStore::default().into_shared(),
            BatchSettings {
                limit,
                ..BatchSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn two_batches_merge_into_one_chunk() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(docs_response(&post_docs(&[5000, 4999, 4998, 4997, 4996])));
        transport.push_query(docs_response(&post_docs(&[4996, 4995])));
        let store = Arc::new(MemoryLocalStore::default());
        let fetcher = fetcher(transport.clone(), store.clone(), 5);

        let result = fetcher
            .sync_batch(&unit(&["public"]), true, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            result,
            BatchResult { eof: true, block_start: 5000, block_end: 4995, first_sync: true }
        );
        let entries = fetcher.chunks().lock().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].block_start, entries[0].block_end, entries[0].eof), (5000, 4995, true));

        // 两次请求按顺序发出：先从「现在」回溯，再续拉缺口
        let calls = transport.query_bodies();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["selector"]["updatedTimeUtc"]["$gte"], 0);
        assert_eq!(calls[0]["selector"]["updatedTimeUtc"]["$lte"], json!(MAX_TIMESTAMP));
        assert_eq!(calls[1]["selector"]["updatedTimeUtc"]["$lte"], 4996);
        assert_eq!(calls[1]["selector"]["updatedTimeUtc"]["$gte"], 0);

        assert_eq!(store.document_count(), 6);
        assert_eq!(store.persisted_sync_state().len(), 1);
    }

    #[tokio::test]
    async fn malformed_docs_is_fatal_and_mutates_nothing() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(json!({ "docs": { "not": "an array" } }));
        let store = Arc::new(MemoryLocalStore::default());
        let fetcher = fetcher(transport, store.clone(), 5);

        let err = fetcher
            .sync_batch(&unit(&["public"]), true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DocSyncError::MalformedResponse(_)));
        assert!(fetcher.chunks().lock().is_empty());
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn empty_response_is_transient() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query_raw(None);
        let store = Arc::new(MemoryLocalStore::default());
        let fetcher = fetcher(transport, store, 5);

        let result = fetcher
            .sync_batch(&unit(&["public"]), true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(fetcher.chunks().lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_request_sends_nothing() {
        let transport = Arc::new(MockTransport::new());
        let fetcher = fetcher(transport.clone(), Arc::new(MemoryLocalStore::default()), 5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fetcher.sync_batch(&unit(&["public"]), true, &cancel).await.unwrap();
        assert!(result.is_none());
        assert!(transport.query_bodies().is_empty());
    }

    #[tokio::test]
    async fn cancelled_during_request_skips_continuation() {
        let cancel = CancellationToken::new();
        let transport = Arc::new(MockTransport::new().cancel_on_query(cancel.clone()));
        transport.push_query(docs_response(&post_docs(&[5000, 4999])));
        let store = Arc::new(MemoryLocalStore::default());
        let fetcher = fetcher(transport.clone(), store.clone(), 2);

        let result = fetcher.sync_batch(&unit(&["public"]), true, &cancel).await.unwrap();
        assert!(result.is_none());
        assert_eq!(transport.query_bodies().len(), 1);
        // 已发出的请求不会被中止，但其结果不再提交
        assert!(fetcher.chunks().lock().is_empty());
        assert_eq!(store.document_count(), 0);
    }

    #[tokio::test]
    async fn incremental_sync_joins_existing_chunk() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(docs_response(&post_docs(&[6000, 5500])));
        let store = Arc::new(MemoryLocalStore::default());
        let fetcher = fetcher(transport.clone(), store, 5);
        let key = unit(&["public"]).key();
        fetcher
            .chunks()
            .lock()
            .push(SyncListEntry::new(&key, 5000, 3000, true));

        let result = fetcher
            .sync_batch(&unit(&["public"]), true, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        // 初次窗口带 1000ms 重叠，短页说明整个窗口已查尽
        assert_eq!(transport.query_bodies()[0]["selector"]["updatedTimeUtc"]["$gte"], 4000);
        assert_eq!(
            result,
            BatchResult { eof: true, block_start: 6000, block_end: 3000, first_sync: false }
        );
        assert_eq!(fetcher.chunks().lock().len(), 1);
    }

    #[tokio::test]
    async fn empty_gap_window_closes_the_gap() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(docs_response(&[]));
        let fetcher = fetcher(transport.clone(), Arc::new(MemoryLocalStore::default()), 5);
        let key = unit(&["public"]).key();
        {
            let mut chunks = fetcher.chunks().lock();
            chunks.push(SyncListEntry::new(&key, 9000, 6000, false));
            chunks.push(SyncListEntry::new(&key, 5000, 3000, true));
        }

        let result = fetcher
            .sync_batch(&unit(&["public"]), false, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(transport.query_bodies()[0]["selector"]["updatedTimeUtc"]["$lte"], 6000);
        assert_eq!(transport.query_bodies()[0]["selector"]["updatedTimeUtc"]["$gte"], 5000);
        assert_eq!((result.block_start, result.block_end, result.eof), (9000, 3000, true));
        assert_eq!(fetcher.chunks().lock().len(), 1);
    }

    #[tokio::test]
    async fn empty_store_empty_server_is_eof() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(docs_response(&[]));
        let fetcher = fetcher(transport, Arc::new(MemoryLocalStore::default()), 5);

        let result = fetcher
            .sync_batch(&unit(&["public"]), true, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(result.eof);
        assert!(result.first_sync);
        assert_eq!(fetcher.chunks().lock().entries()[0].block_start, 0);
    }

    #[test]
    fn chunk_for_full_page_uses_document_bounds() {
        let key = unit(&["a"]).key();
        let window = SyncWindow { block_start: MAX_TIMESTAMP, block_end: 0 };
        let entry = chunk_for_page(&key, window, &post_docs(&[30, 20, 10]), 3);
        assert_eq!((entry.block_start, entry.block_end, entry.eof), (30, 10, false));
    }
}
