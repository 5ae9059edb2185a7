//! 增量同步模块
//!
//! 职责：
//! - 记录每一列（文档类型 + 权限组 + 语言）已同步的时间区间
//! - 计算下一次请求的窗口，合并相邻/已到底的区间
//! - 权限变化时裁剪区间，并把工作拆分为互不阻塞的列
//! - 传播墓碑（deleteCmd）

pub mod batch;
pub mod chunk;
pub mod chunk_store;
pub mod merge;
pub mod query;
pub mod runner;
pub mod scheduler;
pub mod trim;

pub use batch::{BatchFetcher, BatchResult, BatchSettings, SyncUnit};
pub use chunk::{ChunkKey, SyncListEntry};
pub use chunk_store::{ChunkStore, Scope, SharedChunkStore, SyncWindow, DEFAULT_TOLERANCE_MS};
pub use merge::{merge_horizontal, merge_vertical, ChunkRange};
pub use query::SyncQuery;
pub use runner::{ColumnOutcome, SyncOptions, SyncRunner};
pub use scheduler::{SyncJob, SyncScheduler};
pub use trim::trim;
