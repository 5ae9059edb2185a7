//! 传输层接口
//!
//! 同步核心只依赖一个 `post(path, body)` 原语；
//! 响应保持为原始 JSON，由调用方校验结构（`docs` 必须是数组）。

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::Result;

pub use http::HttpTransport;

/// 服务端接口路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiPath {
    /// 结构化查询
    Query,
    /// 提交本地修改
    ChangeRequest,
}

impl ApiPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiPath::Query => "query",
            ApiPath::ChangeRequest => "changerequest",
        }
    }
}

impl std::fmt::Display for ApiPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输层
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// 发送请求；`Ok(None)` 表示空响应（临时失败，由调用方决定如何处理）
    async fn post(&self, path: ApiPath, body: serde_json::Value) -> Result<Option<serde_json::Value>>;
}

/// 提交给服务端的修改请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: String,
    pub doc: Document,
}

/// 服务端确认结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// 修改请求的确认
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAck {
    pub id: String,
    pub ack: AckStatus,
    /// 拒绝时服务端返回的权威版本（可能为空）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<Vec<Document>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_wire_format() {
        let ack: ChangeAck = serde_json::from_value(json!({
            "id": "change-1",
            "ack": "rejected",
            "docs": [{"_id": "p1", "type": "post", "updatedTimeUtc": 5}]
        }))
        .unwrap();
        assert_eq!(ack.ack, AckStatus::Rejected);
        assert_eq!(ack.docs.unwrap()[0].id, "p1");

        let accepted: ChangeAck =
            serde_json::from_value(json!({"id": "c2", "ack": "accepted"})).unwrap();
        assert_eq!(accepted.ack, AckStatus::Accepted);
        assert!(accepted.docs.is_none());
    }

    #[test]
    fn api_paths() {
        assert_eq!(ApiPath::Query.as_str(), "query");
        assert_eq!(ApiPath::ChangeRequest.to_string(), "changerequest");
    }
}
