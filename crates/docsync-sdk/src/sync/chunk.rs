//! 同步区间（chunk）模型
//!
//! 一个 chunk 表示：对某个 key（文档类型 + 权限组集合 + 语言集合），
//! `block_end <= updatedTimeUtc <= block_start` 范围内的文档均已同步到本地。

use serde::{Deserialize, Serialize};

use crate::document::{is_content_type, doc_type, GroupId, LanguageCode, Timestamp};

/// 已同步时间区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncListEntry {
    pub chunk_type: String,
    pub member_of: Vec<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<LanguageCode>>,
    pub block_start: Timestamp,
    pub block_end: Timestamp,
    pub eof: bool,
}

impl SyncListEntry {
    pub fn new(key: &ChunkKey, block_start: Timestamp, block_end: Timestamp, eof: bool) -> Self {
        Self {
            chunk_type: key.chunk_type.clone(),
            member_of: key.member_of.clone(),
            languages: key.languages.clone(),
            block_start,
            block_end,
            eof,
        }
    }

    /// 空结果占位 chunk（一次请求未返回任何文档）
    pub fn is_placeholder(&self) -> bool {
        self.block_start == 0
    }
}

/// chunk 的匹配键
///
/// 权限组与语言按集合比较（顺序无关）；构造时即排序去重。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub chunk_type: String,
    pub member_of: Vec<GroupId>,
    pub languages: Option<Vec<LanguageCode>>,
}

impl ChunkKey {
    pub fn new(
        doc_type: &str,
        subtype: Option<&str>,
        member_of: &[GroupId],
        languages: Option<&[LanguageCode]>,
    ) -> Self {
        Self {
            chunk_type: chunk_type(doc_type, subtype),
            member_of: sorted_unique(member_of),
            languages: languages.map(sorted_unique),
        }
    }

    /// 与该列对应的墓碑列（`deleteCmd:{chunk_type}`，如 `deleteCmd:content:post`），
    /// 沿用相同的权限组与语言范围。不同 subtype 的内容列各自拥有墓碑列。
    pub fn delete_cmd_key(&self) -> Self {
        Self {
            chunk_type: chunk_type(doc_type::DELETE_CMD, Some(&self.chunk_type)),
            member_of: self.member_of.clone(),
            languages: self.languages.clone(),
        }
    }

    pub fn matches(&self, entry: &SyncListEntry) -> bool {
        if entry.chunk_type != self.chunk_type {
            return false;
        }
        if !same_set(&entry.member_of, &self.member_of) {
            return false;
        }
        // 语言只在双方都定义时比较
        match (&entry.languages, &self.languages) {
            (Some(a), Some(b)) => same_set(a, b),
            _ => true,
        }
    }
}

/// 计算 chunk 类型：内容类型与墓碑类型按 `type:subtype` 细分
pub fn chunk_type(doc_type: &str, subtype: Option<&str>) -> String {
    match subtype {
        Some(sub) if is_content_type(doc_type) || doc_type == doc_type::DELETE_CMD => {
            format!("{}:{}", doc_type, sub)
        }
        _ => doc_type.to_string(),
    }
}

/// 排序去重
pub fn sorted_unique<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut out = items.to_vec();
    out.sort();
    out.dedup();
    out
}

/// 集合相等（顺序与重复无关）
pub fn same_set<T: Ord + Clone>(a: &[T], b: &[T]) -> bool {
    sorted_unique(a) == sorted_unique(b)
}

/// `a` 中每个元素都在 `b` 中
pub fn is_subset<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.iter().all(|x| b.contains(x))
}
