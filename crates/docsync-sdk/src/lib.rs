//! DocSync SDK - 文档增量同步 SDK
//!
//! 本 SDK 负责把服务端文档按「类型 + 权限组 + 语言」分列增量同步到本地：
//! - 🧩 同步区间：记录每一列已同步的时间范围，合并相邻/已到底的区间
//! - 🔐 权限裁剪：失去的权限组/语言对应的区间会被裁剪，新授权单独拉取
//! - 🪦 墓碑传播：deleteCmd 跟随每一列同步，删除本地缓存
//! - 📤 本地修改：写入即生效，联网后单飞推送并按确认结果调和
//! - ⚙️ 事件系统：统一的同步事件广播
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use docsync_sdk::{DocSyncSDK, StaticAccessControl, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_url("https://docs.example.com")
//!         .build();
//!     let access = Arc::new(StaticAccessControl::new(["public"], ["eng"]));
//!
//!     let sdk = DocSyncSDK::initialize_http(config, access).await?;
//!     sdk.start().await?;
//!     sdk.set_connected(true).await;
//!
//!     let summary = sdk.sync_all().await?;
//!     println!("同步完成: {:?}", summary);
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod changes;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod network;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod version;

#[cfg(test)]
mod testing;

pub use access::{AccessControl, StaticAccessControl};
pub use changes::{ChangeQueue, ChangeStatus, LocalChangeEntry, UpsertOptions};
pub use config::{DocTypeConfig, HttpClientConfig, SyncConfig, SyncConfigBuilder};
pub use document::{Document, GroupId, LanguageCode, Timestamp};
pub use error::{DocSyncError, Result};
pub use events::{EventManager, SyncEvent};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
pub use sdk::{DocSyncSDK, SyncSummary};
pub use storage::{LocalStore, StorageManager};
pub use sync::{BatchResult, ChunkStore, SyncListEntry, SyncOptions, SyncRunner};
pub use transport::{AckStatus, ApiPath, ChangeAck, ChangeRequest, HttpTransport, Transport};
pub use version::version_summary;
