//! 同步查询构造
//!
//! ```json
//! {
//!   "selector": {
//!     "type": "content",
//!     "updatedTimeUtc": { "$lte": 5000, "$gte": 0 },
//!     "memberOf": { "$elemMatch": { "$in": ["group-public"] } },
//!     "parentType": "post",
//!     "language": { "$in": ["lang-eng"] }
//!   },
//!   "limit": 100,
//!   "sort": [{ "updatedTimeUtc": "desc" }],
//!   "use_index": "sync-type-updatedTimeUtc",
//!   "identifier": "sync"
//! }
//! ```

use serde_json::{json, Map, Value};

use super::chunk_store::SyncWindow;
use crate::document::{doc_type, is_content_type, GroupId, LanguageCode};

pub const QUERY_IDENTIFIER: &str = "sync";

/// 一次批量查询的参数
#[derive(Debug, Clone)]
pub struct SyncQuery<'a> {
    pub doc_type: &'a str,
    pub subtype: Option<&'a str>,
    pub member_of: &'a [GroupId],
    pub languages: Option<&'a [LanguageCode]>,
    pub window: SyncWindow,
    pub limit: usize,
    pub use_index: &'a str,
    pub cms: bool,
}

impl SyncQuery<'_> {
    pub fn to_json(&self) -> Value {
        let mut selector = Map::new();
        selector.insert("type".into(), json!(self.doc_type));
        selector.insert(
            "updatedTimeUtc".into(),
            json!({ "$lte": self.window.block_start, "$gte": self.window.block_end }),
        );
        selector.insert(
            "memberOf".into(),
            json!({ "$elemMatch": { "$in": self.member_of } }),
        );

        if is_content_type(self.doc_type) {
            if let Some(parent) = self.subtype {
                selector.insert("parentType".into(), json!(parent));
            }
            if let Some(languages) = self.languages {
                selector.insert("language".into(), json!({ "$in": languages }));
            }
        } else if self.doc_type == doc_type::DELETE_CMD {
            if let Some(target) = self.subtype {
                selector.insert("docType".into(), json!(target));
            }
        }

        let mut query = json!({
            "selector": Value::Object(selector),
            "limit": self.limit,
            "sort": [{ "updatedTimeUtc": "desc" }],
            "use_index": self.use_index,
            "identifier": QUERY_IDENTIFIER,
        });
        if self.cms {
            query["cms"] = json!(true);
        }
        query
    }
}
