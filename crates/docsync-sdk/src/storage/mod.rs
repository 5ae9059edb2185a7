//! 存储层
//!
//! 同步核心只通过 [`LocalStore`] 访问本地持久化；
//! 默认实现 [`StorageManager`] 组合了 SQLite 文档库与 sled KV（同步区间）。

pub mod kv;
pub mod migrate;
pub mod sqlite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::changes::LocalChangeEntry;
use crate::document::Document;
use crate::error::{DocSyncError, Result};
use crate::sync::SyncListEntry;
use kv::KvStore;
use sqlite::DocumentStore;

/// 本地存储接口（由嵌入方的持久化引擎实现）
#[async_trait]
pub trait LocalStore: Send + Sync + std::fmt::Debug {
    /// 批量插入或更新文档（墓碑文档删除其目标）
    async fn bulk_upsert(&self, docs: &[Document]) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Document>>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn put_local_change(&self, entry: &LocalChangeEntry) -> Result<()>;

    async fn local_changes_for_doc(&self, doc_id: &str) -> Result<Vec<LocalChangeEntry>>;

    async fn delete_local_change(&self, id: &str) -> Result<()>;

    /// 最早入队的本地修改（队首，不出队）
    async fn oldest_local_change(&self) -> Result<Option<LocalChangeEntry>>;

    async fn local_change_count(&self) -> Result<usize>;

    async fn load_sync_state(&self) -> Result<Vec<SyncListEntry>>;

    async fn persist_sync_state(&self, entries: &[SyncListEntry]) -> Result<()>;
}

/// 默认存储管理器
#[derive(Debug)]
pub struct StorageManager {
    base_path: PathBuf,
    documents: DocumentStore,
    kv: Arc<KvStore>,
}

impl StorageManager {
    /// 在 `base_path` 下打开 `docsync.db` 与 `kv/`
    pub async fn new(base_path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_path)
            .await
            .map_err(|e| DocSyncError::IO(format!("创建存储目录失败: {}", e)))?;

        let documents = DocumentStore::open(&base_path.join("docsync.db"))?;
        let kv = Arc::new(KvStore::new(base_path).await?);
        info!("✅ 存储管理器初始化完成: {}", base_path.display());

        Ok(Self {
            base_path: base_path.to_path_buf(),
            documents,
            kv,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn kv(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }
}

#[async_trait]
impl LocalStore for StorageManager {
    async fn bulk_upsert(&self, docs: &[Document]) -> Result<()> {
        self.documents.upsert_documents(docs).await
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        self.documents.get_document(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.documents.delete_document(id).await
    }

    async fn put_local_change(&self, entry: &LocalChangeEntry) -> Result<()> {
        self.documents.put_local_change(entry).await
    }

    async fn local_changes_for_doc(&self, doc_id: &str) -> Result<Vec<LocalChangeEntry>> {
        self.documents.local_changes_for_doc(doc_id).await
    }

    async fn delete_local_change(&self, id: &str) -> Result<()> {
        self.documents.delete_local_change(id).await
    }

    async fn oldest_local_change(&self) -> Result<Option<LocalChangeEntry>> {
        self.documents.oldest_local_change().await
    }

    async fn local_change_count(&self) -> Result<usize> {
        self.documents.local_change_count().await
    }

    async fn load_sync_state(&self) -> Result<Vec<SyncListEntry>> {
        Ok(self
            .kv
            .get::<_, Vec<SyncListEntry>>(kv::keys::SYNC_STATE)
            .await?
            .unwrap_or_default())
    }

    async fn persist_sync_state(&self, entries: &[SyncListEntry]) -> Result<()> {
        self.kv.set(kv::keys::SYNC_STATE, &entries).await
    }
}
