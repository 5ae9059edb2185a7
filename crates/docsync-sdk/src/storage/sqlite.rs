//! SQLite 存储模块 - 文档缓存与本地修改队列
//!
//! - `documents`：服务端文档的本地副本（整篇 JSON + 路由字段）
//! - `local_changes`：待确认的本地修改，按插入顺序（seq）先进先出

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::debug;

use crate::changes::{ChangeStatus, LocalChangeEntry};
use crate::document::Document;
use crate::error::{DocSyncError, Result};
use crate::storage::migrate;

/// SQLite 文档存储
#[derive(Debug, Clone)]
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl DocumentStore {
    /// 打开磁盘数据库并执行迁移
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut conn = Connection::open(db_path)
            .map_err(|e| DocSyncError::Database(format!("打开数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;
        tracing::info!("本地文档库初始化完成: {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 内存数据库（测试 / 无持久化场景）
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate::init_db(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 批量写入文档；墓碑文档会删除其指向的文档，本身不落库
    pub async fn upsert_documents(&self, docs: &[Document]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut deleted = 0usize;
        for doc in docs {
            if doc.is_delete_cmd() {
                if let Some(target) = doc.target_id.as_deref() {
                    deleted += tx.execute("DELETE FROM documents WHERE id = ?1", params![target])?;
                }
                continue;
            }
            let body = serde_json::to_string(doc)?;
            tx.execute(
                "INSERT INTO documents (id, doc_type, parent_type, language, updated_time_utc, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    doc_type = excluded.doc_type,
                    parent_type = excluded.parent_type,
                    language = excluded.language,
                    updated_time_utc = excluded.updated_time_utc,
                    body = excluded.body",
                params![
                    doc.id,
                    doc.doc_type,
                    doc.parent_type,
                    doc.language,
                    doc.updated_time_utc,
                    body
                ],
            )?;
        }
        tx.commit()?;
        debug!("写入文档 {} 条，按墓碑删除 {} 条", docs.len(), deleted);
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row("SELECT body FROM documents WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(DocSyncError::from))
            .transpose()
    }

    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn count_documents(&self, doc_type: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE doc_type = ?1",
            params![doc_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// 新增或更新本地修改（按 id 更新时保留原有排队顺序）
    pub async fn put_local_change(&self, entry: &LocalChangeEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        let doc = serde_json::to_string(&entry.doc)?;
        conn.execute(
            "INSERT INTO local_changes (id, doc_id, doc, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                doc = excluded.doc,
                status = excluded.status",
            params![
                entry.id,
                entry.doc_id,
                doc,
                entry.status.map(|s| s.as_str()),
                entry.created_at
            ],
        )?;
        Ok(())
    }

    pub async fn local_changes_for_doc(&self, doc_id: &str) -> Result<Vec<LocalChangeEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, doc_id, doc, status, created_at FROM local_changes
             WHERE doc_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![doc_id], row_to_raw_change)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    pub async fn oldest_local_change(&self) -> Result<Option<LocalChangeEntry>> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT id, doc_id, doc, status, created_at FROM local_changes
                 ORDER BY seq ASC LIMIT 1",
                [],
                row_to_raw_change,
            )
            .optional()?;
        raw.map(RawChange::into_entry).transpose()
    }

    pub async fn delete_local_change(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM local_changes WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn local_change_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM local_changes", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

struct RawChange {
    id: String,
    doc_id: String,
    doc: String,
    status: Option<String>,
    created_at: i64,
}

impl RawChange {
    fn into_entry(self) -> Result<LocalChangeEntry> {
        Ok(LocalChangeEntry {
            id: self.id,
            doc_id: self.doc_id,
            doc: serde_json::from_str(&self.doc)?,
            status: self.status.as_deref().and_then(ChangeStatus::parse),
            created_at: self.created_at,
        })
    }
}

fn row_to_raw_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawChange> {
    Ok(RawChange {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        doc: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
    })
}
