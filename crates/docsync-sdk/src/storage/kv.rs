//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 用于持久化同步状态（chunk 列表）等小体量、整体读写的数据。
//! 值统一以 JSON 序列化。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{DocSyncError, Result};

const SYNC_TREE: &str = "sync";

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    db: Db,
    tree: Tree,
}

impl KvStore {
    /// 打开（或创建）`{base_path}/kv` 下的 sled 数据库
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| DocSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 200;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    db_opt = Some(db);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if !is_lock || attempt + 1 == MAX_OPEN_RETRIES {
                        break;
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            DocSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = db
            .open_tree(SYNC_TREE)
            .map_err(|e| DocSyncError::KvStore(format!("打开 Tree 失败: {}", e)))?;

        Ok(Self { base_path, db, tree })
    }

    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| DocSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        self.tree
            .insert(key, value_bytes)
            .map_err(|e| DocSyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self
            .tree
            .get(key)
            .map_err(|e| DocSyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        match result {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| DocSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let removed = self
            .tree
            .remove(key)
            .map_err(|e| DocSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, bytes) =
                item.map_err(|e| DocSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| DocSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((key.to_vec(), value));
        }
        Ok(results)
    }

    /// 刷盘（关闭前调用）
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| DocSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 常用的键
pub mod keys {
    /// 同步区间列表
    pub const SYNC_STATE: &str = "sync_state:chunks";
}
