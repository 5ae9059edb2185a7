//! SyncRunner - 同步编排
//!
//! 1. 先按当前授权裁剪区间（trim）
//! 2. 用显式工作队列拆分同步单元：
//!    - 新授权的语言单独成列，已跟踪的语言继续原有进度
//!    - 分批授权导致的多个权限组组合各自推进，新增的权限组单独成列
//! 3. 拆分完成后各列并发拉取（只在网络等待处交错）
//! 4. 按需传播墓碑（deleteCmd）列
//! 5. 所有列结束后，再把已到底的列横向合并
//!
//! 每个单元开始前检查取消；提前返回不会破坏已提交的状态。

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::batch::{commit_chunk, BatchFetcher, BatchResult, SyncUnit};
use super::chunk::{chunk_type, sorted_unique, ChunkKey, SyncListEntry};
use super::chunk_store::{ChunkStore, Scope};
use super::merge::merge_horizontal;
use super::trim::trim;
use crate::document::{doc_type, is_content_type, GroupId, LanguageCode};
use crate::error::{DocSyncError, Result};
use crate::events::{event_builders, EventManager};

/// 一次同步调用的参数
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub doc_type: String,
    pub subtype: Option<String>,
    /// 当前授权的权限组
    pub member_of: Vec<GroupId>,
    /// 当前允许的语言（仅内容类型）
    pub languages: Option<Vec<LanguageCode>>,
    pub include_delete_cmds: bool,
}

impl SyncOptions {
    pub fn new<G, S>(doc_type: impl Into<String>, member_of: G) -> Self
    where
        G: IntoIterator<Item = S>,
        S: Into<GroupId>,
    {
        Self {
            doc_type: doc_type.into(),
            subtype: None,
            member_of: member_of.into_iter().map(Into::into).collect(),
            languages: None,
            include_delete_cmds: true,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_languages<L, S>(mut self, languages: L) -> Self
    where
        L: IntoIterator<Item = S>,
        S: Into<LanguageCode>,
    {
        self.languages = Some(languages.into_iter().map(Into::into).collect());
        self
    }

    pub fn include_delete_cmds(mut self, include: bool) -> Self {
        self.include_delete_cmds = include;
        self
    }
}

/// 一列的同步结果；`result` 为 None 表示被取消或遇到临时失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOutcome {
    pub unit: SyncUnit,
    pub result: Option<BatchResult>,
}

/// 工作队列中的单元
#[derive(Debug, Clone)]
struct WorkItem {
    unit: SyncUnit,
    /// 已是一个确定的已跟踪列，不再拆分
    pinned: bool,
}

#[derive(Debug, Clone)]
pub struct SyncRunner {
    fetcher: BatchFetcher,
    events: Option<Arc<EventManager>>,
}

impl SyncRunner {
    pub fn new(fetcher: BatchFetcher) -> Self {
        Self {
            fetcher,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn fetcher(&self) -> &BatchFetcher {
        &self.fetcher
    }

    /// 同步一个文档类型
    #[instrument(skip(self, cancel), fields(doc_type = %options.doc_type))]
    pub async fn sync(
        &self,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ColumnOutcome>> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let content = is_content_type(&options.doc_type);
        let member_of = sorted_unique(&options.member_of);
        let languages = if content {
            Some(sorted_unique(options.languages.as_deref().unwrap_or_default()))
        } else {
            None
        };

        let removed = {
            let mut chunks = self.fetcher.chunks().lock();
            trim(
                &mut chunks,
                &options.doc_type,
                options.subtype.as_deref(),
                &member_of,
                languages.as_deref(),
            )
        };
        if removed > 0 {
            ChunkStore::persist(self.fetcher.chunks(), self.fetcher.store().as_ref()).await?;
        }

        let root = SyncUnit {
            doc_type: options.doc_type.clone(),
            subtype: options.subtype.clone(),
            member_of,
            languages,
        };
        let Some(units) = self.plan(root, cancel) else {
            debug!("同步在拆分阶段被取消: {}", options.doc_type);
            return Ok(Vec::new());
        };
        if units.is_empty() {
            return Ok(Vec::new());
        }
        info!("🔄 {} 同步 {} 列", options.doc_type, units.len());

        let tasks = units
            .into_iter()
            .map(|unit| self.sync_column(unit, options.include_delete_cmds, cancel));
        let mut outcomes = Vec::new();
        let mut first_error: Option<DocSyncError> = None;
        for outcome in join_all(tasks).await {
            match outcome {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!("❌ {} 同步失败: {}", options.doc_type, e);
                    if let Some(events) = &self.events {
                        events
                            .emit(event_builders::sync_failed(&options.doc_type, &e))
                            .await;
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        // 并发期间各列只做纵向合并，全部结束后再横向合并
        if self.recombine(options) {
            if let Err(e) = ChunkStore::persist(self.fetcher.chunks(), self.fetcher.store().as_ref()).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// 横向合并该类型及其墓碑列中已到底的 chunk；有修改时返回 true
    fn recombine(&self, options: &SyncOptions) -> bool {
        let column_type = chunk_type(&options.doc_type, options.subtype.as_deref());
        let tombstone_type = chunk_type(doc_type::DELETE_CMD, Some(&column_type));
        let mut chunks = self.fetcher.chunks().lock();
        let columns = merge_horizontal(&mut chunks, &column_type).is_some();
        let tombstones = merge_horizontal(&mut chunks, &tombstone_type).is_some();
        columns || tombstones
    }

    /// 把根单元拆分为可以直接拉取的列；取消时返回 None
    fn plan(&self, root: SyncUnit, cancel: &CancellationToken) -> Option<Vec<SyncUnit>> {
        let mut work = VecDeque::from([WorkItem {
            unit: root,
            pinned: false,
        }]);
        let mut seen: HashSet<ChunkKey> = HashSet::new();
        let mut resolved = Vec::new();

        while let Some(item) = work.pop_front() {
            if cancel.is_cancelled() {
                return None;
            }
            let unit = if item.pinned {
                Some(item.unit)
            } else {
                let chunks = self.fetcher.chunks().lock();
                split_unit(&chunks, item.unit, &mut work)
            };
            if let Some(unit) = unit {
                if seen.insert(unit.key()) {
                    resolved.push(unit);
                }
            }
        }
        Some(resolved)
    }

    async fn sync_column(
        &self,
        unit: SyncUnit,
        include_delete_cmds: bool,
        cancel: &CancellationToken,
    ) -> Result<ColumnOutcome> {
        if cancel.is_cancelled() {
            return Ok(ColumnOutcome { unit, result: None });
        }
        let key = unit.key();
        if let Some(events) = &self.events {
            events
                .emit(event_builders::column_started(
                    &key.chunk_type,
                    &key.member_of,
                    key.languages.as_deref(),
                ))
                .await;
        }

        let result = self.fetcher.sync_batch_deferred(&unit, true, cancel).await?;

        if let Some(result) = result {
            if include_delete_cmds && unit.doc_type != doc_type::DELETE_CMD {
                self.propagate_delete_cmds(&unit, &result, cancel).await?;
            }
            if let Some(events) = &self.events {
                events
                    .emit(event_builders::column_finished(
                        &key.chunk_type,
                        &key.member_of,
                        result.block_start,
                        result.block_end,
                        result.eof,
                    ))
                    .await;
            }
        }
        Ok(ColumnOutcome { unit, result })
    }

    /// 新列：墓碑列直接沿用本列的时间窗口（新拉取的数据不需要更早的墓碑）；
    /// 已有列：增量拉取墓碑
    async fn propagate_delete_cmds(
        &self,
        unit: &SyncUnit,
        result: &BatchResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let delete_unit = unit.delete_cmd_unit();
        let delete_key = delete_unit.key();
        let exists = self.fetcher.chunks().lock().has_column(&delete_key);

        if result.first_sync && !exists {
            {
                let mut chunks = self.fetcher.chunks().lock();
                let entry = SyncListEntry::new(&delete_key, result.block_start, result.block_end, result.eof);
                commit_chunk(&mut chunks, &delete_key, entry, false);
            }
            debug!("墓碑列沿用新列窗口: {}", delete_key.chunk_type);
            ChunkStore::persist(self.fetcher.chunks(), self.fetcher.store().as_ref()).await?;
        } else if exists && !result.first_sync {
            self.fetcher.sync_batch_deferred(&delete_unit, true, cancel).await?;
        }
        Ok(())
    }
}

/// 拆分一个单元；返回 None 表示该单元已全部交给队列中的子单元
fn split_unit(chunks: &ChunkStore, mut unit: SyncUnit, work: &mut VecDeque<WorkItem>) -> Option<SyncUnit> {
    if unit.member_of.is_empty() {
        return None;
    }
    let ct = chunk_type(&unit.doc_type, unit.subtype.as_deref());

    // 语言：新授权的语言先单独推进
    if let Some(languages) = unit.languages.clone() {
        if languages.is_empty() {
            return None;
        }
        let group_scope = Scope {
            member_of: &unit.member_of,
            languages: None,
        };
        let tracked = chunks.get_languages(&ct, Some(group_scope));
        let (existing, new): (Vec<LanguageCode>, Vec<LanguageCode>) =
            languages.into_iter().partition(|l| tracked.contains(l));
        if !existing.is_empty() && !new.is_empty() {
            debug!("{} 新增语言 {:?}", ct, new);
            work.push_back(WorkItem {
                unit: SyncUnit {
                    languages: Some(new),
                    ..unit.clone()
                },
                pinned: false,
            });
            unit.languages = Some(existing);
        }
    }

    // 权限组：已跟踪的组合各自推进，新增的权限组单独成列
    let scope = Scope {
        member_of: &unit.member_of,
        languages: unit.languages.as_deref(),
    };
    let existing_groups = chunks.get_groups(&ct, Some(scope));
    let new_groups: Vec<GroupId> = unit
        .member_of
        .iter()
        .filter(|g| !existing_groups.contains(g))
        .cloned()
        .collect();
    let columns = chunks.get_columns(&ct, Some(scope));

    if columns.len() > 1 || !new_groups.is_empty() {
        for column in columns {
            work.push_back(WorkItem {
                unit: SyncUnit {
                    doc_type: unit.doc_type.clone(),
                    subtype: unit.subtype.clone(),
                    member_of: column.member_of,
                    languages: column.languages.or_else(|| unit.languages.clone()),
                },
                pinned: true,
            });
        }
        if new_groups.is_empty() {
            return None;
        }
        debug!("{} 新增权限组 {:?}", ct, new_groups);
        unit.member_of = new_groups;
    }
    Some(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::batch::BatchSettings;
    use crate::testing::{docs_response, post_docs, MemoryLocalStore, MockTransport};

    fn s(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|x| x.to_string()).collect()
    }

    fn runner(transport: Arc<MockTransport>, limit: usize) -> SyncRunner {
        let fetcher = BatchFetcher::new(
            transport,
            Arc::new(MemoryLocalStore::default()),
            ChunkStore::default().into_shared(),
            BatchSettings {
                limit,
                ..BatchSettings::default()
            },
        );
        SyncRunner::new(fetcher)
    }

    fn seed(runner: &SyncRunner, entry: SyncListEntry) {
        runner.fetcher().chunks().lock().push(entry);
    }

    fn entry(chunk_type: &str, groups: &[&str], langs: Option<&[&str]>, start: i64, end: i64, eof: bool) -> SyncListEntry {
        SyncListEntry {
            chunk_type: chunk_type.into(),
            member_of: s(groups),
            languages: langs.map(s),
            block_start: start,
            block_end: end,
            eof,
        }
    }

    fn planned(runner: &SyncRunner, root: SyncUnit) -> Vec<SyncUnit> {
        let mut units = runner.plan(root, &CancellationToken::new()).unwrap();
        units.sort_by(|a, b| a.member_of.cmp(&b.member_of).then(a.languages.cmp(&b.languages)));
        units
    }

    fn post_unit(groups: &[&str]) -> SyncUnit {
        SyncUnit {
            doc_type: "post".into(),
            subtype: None,
            member_of: s(groups),
            languages: None,
        }
    }

    #[test]
    fn fresh_type_is_one_column() {
        let runner = runner(Arc::new(MockTransport::new()), 5);
        let units = planned(&runner, post_unit(&["a", "b"]));
        assert_eq!(units, vec![post_unit(&["a", "b"])]);
    }

    #[test]
    fn new_group_gets_its_own_column() {
        let runner = runner(Arc::new(MockTransport::new()), 5);
        seed(&runner, entry("post", &["a"], None, 5000, 0, true));

        let units = planned(&runner, post_unit(&["a", "b"]));
        assert_eq!(units, vec![post_unit(&["a"]), post_unit(&["b"])]);
    }

    #[test]
    fn fragmented_group_sets_advance_independently() {
        let runner = runner(Arc::new(MockTransport::new()), 5);
        seed(&runner, entry("post", &["a"], None, 9000, 8000, false));
        seed(&runner, entry("post", &["a", "b"], None, 5000, 0, true));

        // 两个组合都已跟踪，不会无限拆分
        let units = planned(&runner, post_unit(&["a", "b"]));
        assert_eq!(units, vec![post_unit(&["a"]), post_unit(&["a", "b"])]);
    }

    #[test]
    fn new_language_gets_its_own_column() {
        let runner = runner(Arc::new(MockTransport::new()), 5);
        seed(&runner, entry("content:post", &["a"], Some(&["eng"]), 5000, 0, true));

        let root = SyncUnit {
            doc_type: "content".into(),
            subtype: Some("post".into()),
            member_of: s(&["a"]),
            languages: Some(s(&["eng", "fra"])),
        };
        let units = planned(&runner, root);
        let langs: Vec<_> = units.iter().map(|u| u.languages.clone().unwrap()).collect();
        assert_eq!(langs, vec![s(&["eng"]), s(&["fra"])]);
    }

    #[test]
    fn no_groups_or_languages_means_nothing_to_do() {
        let runner = runner(Arc::new(MockTransport::new()), 5);
        assert!(planned(&runner, post_unit(&[])).is_empty());

        let root = SyncUnit {
            doc_type: "content".into(),
            subtype: Some("post".into()),
            member_of: s(&["a"]),
            languages: Some(vec![]),
        };
        assert!(planned(&runner, root).is_empty());
    }

    #[tokio::test]
    async fn first_sync_mirrors_delete_cmd_column() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(docs_response(&post_docs(&[5000, 4999])));
        let runner = runner(transport.clone(), 5);

        let outcomes = runner
            .sync(&SyncOptions::new("post", ["public"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.unwrap().first_sync);

        // 只发出了一次内容查询，墓碑列直接沿用窗口
        assert_eq!(transport.query_bodies().len(), 1);
        let entries = runner.fetcher().chunks().lock().snapshot();
        let tombstones: Vec<_> = entries.iter().filter(|e| e.chunk_type == "deleteCmd:post").collect();
        assert_eq!(tombstones.len(), 1);
        assert_eq!((tombstones[0].block_start, tombstones[0].block_end), (5000, 4999));
        assert!(tombstones[0].eof);
    }

    #[tokio::test]
    async fn later_sync_fetches_delete_cmds() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(docs_response(&post_docs(&[5000, 4999])));
        let runner = runner(transport.clone(), 5);
        let options = SyncOptions::new("post", ["public"]);

        runner.sync(&options, &CancellationToken::new()).await.unwrap();
        runner.sync(&options, &CancellationToken::new()).await.unwrap();

        let bodies = transport.query_bodies();
        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[1]["selector"]["type"], "post");
        assert_eq!(bodies[2]["selector"]["type"], "deleteCmd");
        assert_eq!(bodies[2]["selector"]["docType"], "post");
        // 第二轮从已有区间减去容差开始
        assert_eq!(bodies[1]["selector"]["updatedTimeUtc"]["$gte"], 4000);
    }

    #[tokio::test]
    async fn delete_cmds_skipped_when_not_requested() {
        let transport = Arc::new(MockTransport::new());
        let runner = runner(transport.clone(), 5);
        let options = SyncOptions::new("post", ["public"]).include_delete_cmds(false);

        runner.sync(&options, &CancellationToken::new()).await.unwrap();
        runner.sync(&options, &CancellationToken::new()).await.unwrap();

        assert!(transport
            .query_bodies()
            .iter()
            .all(|b| b["selector"]["type"] == "post"));
        assert!(runner
            .fetcher()
            .chunks()
            .lock()
            .entries()
            .iter()
            .all(|e| e.chunk_type == "post"));
    }

    #[tokio::test]
    async fn revoked_group_is_trimmed_before_sync() {
        let transport = Arc::new(MockTransport::new());
        let runner = runner(transport.clone(), 5);
        seed(&runner, entry("post", &["a", "b"], None, 5000, 0, true));

        runner
            .sync(&SyncOptions::new("post", ["a"]), &CancellationToken::new())
            .await
            .unwrap();

        let body = &transport.query_bodies()[0];
        assert_eq!(body["selector"]["memberOf"]["$elemMatch"]["$in"], serde_json::json!(["a"]));
        assert!(runner
            .fetcher()
            .chunks()
            .lock()
            .entries()
            .iter()
            .all(|e| e.member_of == s(&["a"])));
    }

    #[tokio::test]
    async fn columns_recombine_once_all_reach_eof() {
        let transport = Arc::new(MockTransport::new());
        let runner = runner(transport.clone(), 5);
        seed(&runner, entry("post", &["a"], None, 5000, 0, true));

        runner
            .sync(
                &SyncOptions::new("post", ["a", "b"]).include_delete_cmds(false),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // a 追平、b 从空开始，两列都到底后合并为一列
        assert_eq!(transport.query_bodies().len(), 2);
        let entries = runner.fetcher().chunks().lock().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].member_of, s(&["a", "b"]));
        assert!(entries[0].eof);
    }

    #[tokio::test]
    async fn content_subtypes_keep_their_own_delete_cmd_columns() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(docs_response(&post_docs(&[5000, 4999])));
        let runner = runner(transport.clone(), 5);
        let tag = SyncOptions::new("content", ["a", "b"])
            .with_subtype("tag")
            .with_languages(["eng"]);
        let post = SyncOptions::new("content", ["a"])
            .with_subtype("post")
            .with_languages(["eng"]);
        let cancel = CancellationToken::new();

        runner.sync(&tag, &cancel).await.unwrap();
        runner.sync(&post, &cancel).await.unwrap();

        // post 的权限组更少，但不会裁剪 tag 的墓碑列
        let entries = runner.fetcher().chunks().lock().snapshot();
        let tag_tombstones: Vec<_> = entries
            .iter()
            .filter(|e| e.chunk_type == "deleteCmd:content:tag")
            .collect();
        assert_eq!(tag_tombstones.len(), 1);
        assert_eq!(tag_tombstones[0].member_of, s(&["a", "b"]));
        assert!(entries
            .iter()
            .any(|e| e.chunk_type == "deleteCmd:content:post" && e.member_of == s(&["a"])));

        let before = transport.query_bodies().len();
        runner.sync(&tag, &cancel).await.unwrap();
        let bodies = transport.query_bodies();
        let third: Vec<_> = bodies[before..].iter().collect();
        assert_eq!(third.len(), 2);
        assert_eq!(third[0]["selector"]["parentType"], "tag");
        assert_eq!(third[1]["selector"]["type"], "deleteCmd");
        assert_eq!(third[1]["selector"]["docType"], "content");
        assert_eq!(third[1]["selector"]["memberOf"]["$elemMatch"]["$in"], serde_json::json!(["a", "b"]));
    }

    #[tokio::test]
    async fn recombining_waits_for_every_column() {
        let transport = Arc::new(MockTransport::new());
        let runner = runner(transport.clone(), 5);
        seed(&runner, entry("post", &["a"], None, 5000, 0, true));
        seed(&runner, entry("deleteCmd:post", &["a"], None, 5000, 0, true));

        // 新组 b 先完成并到底；a 仍需按自己的进度增量拉取
        runner
            .sync(&SyncOptions::new("post", ["a", "b"]), &CancellationToken::new())
            .await
            .unwrap();

        let bodies = transport.query_bodies();
        let for_a: Vec<_> = bodies
            .iter()
            .filter(|b| b["selector"]["memberOf"]["$elemMatch"]["$in"] == serde_json::json!(["a"]))
            .collect();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0]["selector"]["type"], "post");
        assert_eq!(for_a[1]["selector"]["type"], "deleteCmd");
        assert!(for_a
            .iter()
            .all(|b| b["selector"]["updatedTimeUtc"]["$gte"] == 4000));

        let entries = runner.fetcher().chunks().lock().snapshot();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.member_of == s(&["a", "b"]) && e.eof));
    }

    #[tokio::test]
    async fn cancelled_sync_does_nothing() {
        let transport = Arc::new(MockTransport::new());
        let runner = runner(transport.clone(), 5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = runner
            .sync(&SyncOptions::new("post", ["public"]), &cancel)
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_response_surfaces_to_caller() {
        let transport = Arc::new(MockTransport::new());
        transport.push_query(serde_json::json!({ "docs": "nope" }));
        let runner = runner(transport, 5);

        let err = runner
            .sync(&SyncOptions::new("post", ["public"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DocSyncError::MalformedResponse(_)));
        assert!(runner.fetcher().chunks().lock().is_empty());
    }
}
