//! ChunkStore - 已同步区间列表
//!
//! 由单个协调者持有，通过 `SharedChunkStore` 句柄共享给各列。
//! 所有修改都在同步代码块中完成（不跨 `.await` 持锁），
//! 因此同一 key 的「追加 + 合并」是原子的。

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::chunk::{is_subset, sorted_unique, ChunkKey, SyncListEntry};
use crate::document::{GroupId, LanguageCode, Timestamp, MAX_TIMESTAMP};
use crate::error::Result;
use crate::storage::LocalStore;

/// 默认重叠容差（毫秒），防止两次同步之间因时钟偏差产生缺口
pub const DEFAULT_TOLERANCE_MS: Timestamp = 1000;

pub type SharedChunkStore = Arc<Mutex<ChunkStore>>;

/// 下一次请求的查询窗口 `[block_end, block_start]`（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub block_start: Timestamp,
    pub block_end: Timestamp,
}

impl SyncWindow {
    /// 窗口下界为 0：该列从空开始（或本次要回溯到最早的数据）
    pub fn reaches_beginning(&self) -> bool {
        self.block_end == 0
    }
}

/// 查询范围：只统计落在该权限组/语言范围内的 chunk
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub member_of: &'a [GroupId],
    pub languages: Option<&'a [LanguageCode]>,
}

impl Scope<'_> {
    fn contains(&self, entry: &SyncListEntry) -> bool {
        if !is_subset(&entry.member_of, self.member_of) {
            return false;
        }
        match (&entry.languages, self.languages) {
            (Some(tracked), Some(scope)) => is_subset(tracked, scope),
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    entries: Vec<SyncListEntry>,
    tolerance_ms: Timestamp,
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_MS)
    }
}

impl ChunkStore {
    pub fn new(tolerance_ms: Timestamp) -> Self {
        Self {
            entries: Vec::new(),
            tolerance_ms,
        }
    }

    pub fn with_entries(tolerance_ms: Timestamp, entries: Vec<SyncListEntry>) -> Self {
        Self {
            entries,
            tolerance_ms,
        }
    }

    pub fn into_shared(self) -> SharedChunkStore {
        Arc::new(Mutex::new(self))
    }

    /// 从本地持久化加载
    pub async fn load(store: &dyn LocalStore, tolerance_ms: Timestamp) -> Result<Self> {
        let entries = store.load_sync_state().await?;
        info!("已加载同步区间: {} 条", entries.len());
        Ok(Self::with_entries(tolerance_ms, entries))
    }

    /// 持久化共享句柄的当前快照（锁只在拷贝时持有）
    pub async fn persist(shared: &SharedChunkStore, store: &dyn LocalStore) -> Result<()> {
        let snapshot = shared.lock().snapshot();
        debug!("持久化同步区间: {} 条", snapshot.len());
        store.persist_sync_state(&snapshot).await
    }

    pub fn entries(&self) -> &[SyncListEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<SyncListEntry> {
        &mut self.entries
    }

    pub fn snapshot(&self) -> Vec<SyncListEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: SyncListEntry) {
        self.entries.push(entry);
    }

    /// 某个 key 是否已有任何 chunk（即该列已存在）
    pub fn has_column(&self, key: &ChunkKey) -> bool {
        self.entries.iter().any(|e| key.matches(e))
    }

    fn tracked<'a>(
        &'a self,
        chunk_type: &'a str,
        scope: Option<Scope<'a>>,
    ) -> impl Iterator<Item = &'a SyncListEntry> + 'a {
        self.entries.iter().filter(move |e| {
            e.chunk_type == chunk_type && scope.map_or(true, |s| s.contains(e))
        })
    }

    /// 已跟踪的权限组并集
    pub fn get_groups(&self, chunk_type: &str, scope: Option<Scope<'_>>) -> Vec<GroupId> {
        let all: Vec<GroupId> = self
            .tracked(chunk_type, scope)
            .flat_map(|e| e.member_of.iter().cloned())
            .collect();
        sorted_unique(&all)
    }

    /// 已跟踪的不同权限组组合（多于一个说明权限是分批授予的，列尚未合并）
    pub fn get_group_sets(&self, chunk_type: &str, scope: Option<Scope<'_>>) -> Vec<Vec<GroupId>> {
        let sets: Vec<Vec<GroupId>> = self
            .tracked(chunk_type, scope)
            .map(|e| sorted_unique(&e.member_of))
            .collect();
        sorted_unique(&sets)
    }

    /// 已跟踪的语言并集（仅内容类型有语言）
    pub fn get_languages(&self, chunk_type: &str, scope: Option<Scope<'_>>) -> Vec<LanguageCode> {
        let all: Vec<LanguageCode> = self
            .tracked(chunk_type, scope)
            .flat_map(|e| e.languages.iter().flatten().cloned())
            .collect();
        sorted_unique(&all)
    }

    /// 已跟踪的不同列（权限组 + 语言组合）
    pub fn get_columns(&self, chunk_type: &str, scope: Option<Scope<'_>>) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = Vec::new();
        for entry in self.tracked(chunk_type, scope) {
            let key = ChunkKey {
                chunk_type: entry.chunk_type.clone(),
                member_of: sorted_unique(&entry.member_of),
                languages: entry.languages.as_deref().map(sorted_unique),
            };
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// 计算下一次请求的窗口
    ///
    /// 列表按 `block_start` 降序，下标 0 为最新的 chunk。
    pub fn calc_chunk(&self, key: &ChunkKey, initial_sync: bool) -> SyncWindow {
        let mut list: Vec<&SyncListEntry> = self.entries.iter().filter(|e| key.matches(e)).collect();
        list.sort_by(|a, b| b.block_start.cmp(&a.block_start));

        match list.first() {
            None => SyncWindow {
                block_start: MAX_TIMESTAMP,
                block_end: 0,
            },
            Some(newest) if initial_sync => SyncWindow {
                block_start: MAX_TIMESTAMP,
                block_end: (newest.block_start - self.tolerance_ms).max(0),
            },
            Some(newest) => SyncWindow {
                block_start: newest.block_end,
                block_end: list.get(1).map(|next| next.block_start).unwrap_or(0),
            },
        }
    }
}
