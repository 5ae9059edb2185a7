//! 权限收缩后的区间裁剪
//!
//! 不再授权的权限组/语言从 chunk 中移除；集合被清空的 chunk 整条删除。

use tracing::info;

use super::chunk::{chunk_type, SyncListEntry};
use super::chunk_store::ChunkStore;
use crate::document::{doc_type, GroupId, LanguageCode};

/// 裁剪该类型（及其墓碑列）的所有 chunk，返回被整条删除的数量
pub fn trim(
    store: &mut ChunkStore,
    doc_type_name: &str,
    subtype: Option<&str>,
    member_of: &[GroupId],
    languages: Option<&[LanguageCode]>,
) -> usize {
    let column_type = chunk_type(doc_type_name, subtype);
    let types = [
        chunk_type(doc_type::DELETE_CMD, Some(&column_type)),
        column_type,
    ];

    let entries = store.entries_mut();
    let before = entries.len();
    entries.retain_mut(|entry| {
        if !types.contains(&entry.chunk_type) {
            return true;
        }
        trim_entry(entry, member_of, languages)
    });

    let removed = before - entries.len();
    if removed > 0 {
        info!("权限变更，移除 {} 条不再授权的同步区间 ({})", removed, types[1]);
    }
    removed
}

/// 返回 false 表示该 chunk 已空，应删除
fn trim_entry(
    entry: &mut SyncListEntry,
    member_of: &[GroupId],
    languages: Option<&[LanguageCode]>,
) -> bool {
    entry.member_of.retain(|g| member_of.contains(g));
    if entry.member_of.is_empty() {
        return false;
    }
    if let (Some(tracked), Some(allowed)) = (entry.languages.as_mut(), languages) {
        tracked.retain(|l| allowed.contains(l));
        if tracked.is_empty() {
            return false;
        }
    }
    true
}
