//! 文档模型
//!
//! 引擎只关心路由相关的字段（类型、更新时间、权限组、语言、墓碑目标），
//! 其余字段原样保存在 `extra` 中透传，不做 schema 校验。

use serde::{Deserialize, Serialize};

/// 权限组 ID
pub type GroupId = String;
/// 语言代码
pub type LanguageCode = String;
/// UTC 毫秒时间戳
pub type Timestamp = i64;

/// 「现在」之后的上界，用于从最新数据开始向旧数据回溯
pub const MAX_TIMESTAMP: Timestamp = i64::MAX;

/// 常用文档类型
pub mod doc_type {
    /// 内容文档（按 parentType 区分 post / tag，并按语言过滤）
    pub const CONTENT: &str = "content";
    /// 墓碑：指示客户端删除某个已缓存文档
    pub const DELETE_CMD: &str = "deleteCmd";
    pub const POST: &str = "post";
    pub const TAG: &str = "tag";
    pub const GROUP: &str = "group";
    pub const LANGUAGE: &str = "language";
}

/// 是否为按语言分片的内容类型
pub fn is_content_type(doc_type: &str) -> bool {
    doc_type == doc_type::CONTENT
}

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// 服务端文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub updated_time_utc: Timestamp,
    #[serde(default)]
    pub member_of: Vec<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<LanguageCode>,
    /// 墓碑目标文档的类型（仅 deleteCmd）
    #[serde(rename = "docType", default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    /// 墓碑目标文档 ID（仅 deleteCmd）
    #[serde(rename = "docId", default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// 其余业务字段
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            updated_time_utc: 0,
            member_of: Vec::new(),
            parent_type: None,
            language: None,
            target_type: None,
            target_id: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_updated_time(mut self, updated_time_utc: Timestamp) -> Self {
        self.updated_time_utc = updated_time_utc;
        self
    }

    pub fn with_member_of<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<GroupId>,
    {
        self.member_of = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// 是否为墓碑文档
    pub fn is_delete_cmd(&self) -> bool {
        self.doc_type == doc_type::DELETE_CMD
    }
}
