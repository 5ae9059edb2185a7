//! 区间合并
//!
//! - 纵向合并：同一 key 下时间上相邻/重叠的 chunk 合并为一个
//! - 横向合并：同一 chunk 类型下所有已到底（eof）的列合并为一列，
//!   避免稳态轮询一直付出「权限组 × 语言」数量的请求
//!
//! 两种合并都是纯内存操作，重复执行是幂等的。

use tracing::debug;

use super::chunk::{sorted_unique, ChunkKey, SyncListEntry};
use super::chunk_store::ChunkStore;
use crate::document::Timestamp;

/// 合并后的区间摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub eof: bool,
    pub block_start: Timestamp,
    pub block_end: Timestamp,
}

impl From<&SyncListEntry> for ChunkRange {
    fn from(entry: &SyncListEntry) -> Self {
        Self {
            eof: entry.eof,
            block_start: entry.block_start,
            block_end: entry.block_end,
        }
    }
}

/// 纵向合并
///
/// 按 `block_start` 降序遍历相邻对，当 `current.block_end <= next.block_start`
/// 或 `next` 为空结果占位（`block_start == 0`）时合并，并在同一下标重试，
/// 因此 3 个及以上的链一次即可合并完。其他 key 的 chunk 不受影响。
///
/// 返回最新 chunk 的区间；该 key 没有任何 chunk 时返回 None。
pub fn merge_vertical(store: &mut ChunkStore, key: &ChunkKey) -> Option<ChunkRange> {
    let entries = store.entries_mut();
    let (mut list, rest): (Vec<SyncListEntry>, Vec<SyncListEntry>) =
        entries.drain(..).partition(|e| key.matches(e));
    *entries = rest;

    list.sort_by(|a, b| b.block_start.cmp(&a.block_start));

    let mut i = 0;
    while i + 1 < list.len() {
        let placeholder = list[i + 1].is_placeholder();
        if list[i].block_end <= list[i + 1].block_start || placeholder {
            let next = list.remove(i + 1);
            // next.block_end == 0 表示没有新数据，保留当前下界
            if next.block_end != 0 {
                list[i].block_end = list[i].block_end.min(next.block_end);
            }
            // 占位 chunk 只在其窗口回溯到最早数据时才断言 eof
            list[i].eof = if placeholder {
                list[i].eof || next.eof
            } else {
                next.eof
            };
            continue;
        }
        i += 1;
    }

    let result = list.first().map(ChunkRange::from);
    if let Some(range) = &result {
        debug!(
            "纵向合并完成: {} {:?} -> [{}, {}] eof={} (剩余 {} 段)",
            key.chunk_type,
            key.member_of,
            range.block_end,
            range.block_start,
            range.eof,
            list.len()
        );
    }
    entries.extend(list);
    result
}

/// 横向合并
///
/// 同一 `chunk_type` 下所有 `eof == true` 的 chunk 合并为一个：
/// 权限组/语言取排序去重后的并集，`block_start` 取最大值，`block_end` 取最小值。
/// 少于两个可合并 chunk 时不做任何修改并返回 None。
pub fn merge_horizontal(store: &mut ChunkStore, chunk_type: &str) -> Option<ChunkRange> {
    let entries = store.entries_mut();
    let eligible = |e: &SyncListEntry| e.chunk_type == chunk_type && e.eof;
    if entries.iter().filter(|e| eligible(e)).count() < 2 {
        return None;
    }

    let (list, rest): (Vec<SyncListEntry>, Vec<SyncListEntry>) =
        entries.drain(..).partition(|e| eligible(e));
    *entries = rest;

    let groups: Vec<String> = list.iter().flat_map(|e| e.member_of.iter().cloned()).collect();
    let languages = if list.iter().any(|e| e.languages.is_some()) {
        let all: Vec<String> = list
            .iter()
            .flat_map(|e| e.languages.iter().flatten().cloned())
            .collect();
        Some(sorted_unique(&all))
    } else {
        None
    };

    let merged = SyncListEntry {
        chunk_type: chunk_type.to_string(),
        member_of: sorted_unique(&groups),
        languages,
        block_start: list.iter().map(|e| e.block_start).max().unwrap_or(0),
        block_end: list.iter().map(|e| e.block_end).min().unwrap_or(0),
        eof: true,
    };
    debug!(
        "横向合并 {}: {} 列 -> {:?} {:?}",
        chunk_type,
        list.len(),
        merged.member_of,
        merged.languages
    );

    let range = ChunkRange::from(&merged);
    entries.push(merged);
    Some(range)
}
