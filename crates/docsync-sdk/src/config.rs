//! SDK 配置

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::document::{doc_type, Timestamp};
use crate::error::{DocSyncError, Result};
use crate::sync::DEFAULT_TOLERANCE_MS;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(15),
            request_timeout_secs: Some(60),
        }
    }
}

/// 需要同步的文档类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocTypeConfig {
    pub doc_type: String,
    /// 内容文档的父类型（post / tag）
    pub subtype: Option<String>,
    /// 向 AccessControl 查询权限组时使用的操作
    pub permission: String,
}

impl DocTypeConfig {
    pub fn new(doc_type: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            subtype: None,
            permission: "view".to_string(),
        }
    }

    pub fn content(parent_type: impl Into<String>) -> Self {
        Self {
            subtype: Some(parent_type.into()),
            ..Self::new(doc_type::CONTENT)
        }
    }
}

/// 同步 SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 服务端 API 基础 URL
    pub api_url: String,
    pub auth_token: Option<String>,
    /// 单次查询的文档上限；返回数量小于它即视为到底（eof）
    pub batch_limit: usize,
    /// 初次同步窗口与已有区间的重叠容差（毫秒）
    pub tolerance_ms: Timestamp,
    /// 是否同步墓碑（deleteCmd）
    pub include_delete_cmds: bool,
    /// 以 CMS 身份查询（可以看到未发布的文档）
    pub cms: bool,
    /// 定时同步间隔（秒）
    pub sync_interval_secs: u64,
    /// 同步失败后的固定重试延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 重试延迟的随机抖动比例（0.0 ~ 1.0）
    pub retry_jitter: f64,
    pub doc_types: Vec<DocTypeConfig>,
    /// 查询使用的索引名（use_index）
    pub index_hint: String,
    pub delete_cmd_index_hint: String,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    pub http_client_config: HttpClientConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_url: String::new(),
            auth_token: None,
            batch_limit: 100,
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            include_delete_cmds: true,
            cms: false,
            sync_interval_secs: 300,
            retry_delay_ms: 5000,
            retry_jitter: 0.1,
            doc_types: vec![
                DocTypeConfig::new(doc_type::GROUP),
                DocTypeConfig::new(doc_type::LANGUAGE),
                DocTypeConfig::new(doc_type::POST),
                DocTypeConfig::new(doc_type::TAG),
                DocTypeConfig::content(doc_type::POST),
                DocTypeConfig::content(doc_type::TAG),
            ],
            index_hint: "sync-type-updatedTimeUtc".to_string(),
            delete_cmd_index_hint: "sync-deleteCmd-updatedTimeUtc".to_string(),
            event_buffer_size: 1000,
            http_client_config: HttpClientConfig::default(),
        }
    }
}

/// 默认数据目录 ~/.docsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".docsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".docsync")
    } else {
        PathBuf::from("./docsync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_limit == 0 {
            return Err(DocSyncError::Config("batch_limit 必须大于 0".to_string()));
        }
        if self.tolerance_ms < 0 {
            return Err(DocSyncError::Config("tolerance_ms 不能为负数".to_string()));
        }
        if self.doc_types.is_empty() {
            return Err(DocSyncError::Config("至少需要配置一个同步文档类型".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(DocSyncError::Config("retry_jitter 必须在 0.0 ~ 1.0 之间".to_string()));
        }
        Ok(())
    }

    /// 构建 HTTP 传输时额外要求 api_url
    pub fn validate_for_http(&self) -> Result<()> {
        self.validate()?;
        if self.api_url.trim().is_empty() {
            return Err(DocSyncError::Config("api_url 不能为空".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn batch_limit(mut self, limit: usize) -> Self {
        self.config.batch_limit = limit;
        self
    }

    pub fn tolerance_ms(mut self, tolerance: Timestamp) -> Self {
        self.config.tolerance_ms = tolerance;
        self
    }

    pub fn include_delete_cmds(mut self, include: bool) -> Self {
        self.config.include_delete_cmds = include;
        self
    }

    pub fn cms(mut self, cms: bool) -> Self {
        self.config.cms = cms;
        self
    }

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync_interval_secs = secs;
        self
    }

    pub fn retry_delay_ms(mut self, delay: u64) -> Self {
        self.config.retry_delay_ms = delay;
        self
    }

    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.config.retry_jitter = jitter;
        self
    }

    pub fn doc_types(mut self, doc_types: Vec<DocTypeConfig>) -> Self {
        self.config.doc_types = doc_types;
        self
    }

    pub fn index_hint<S: Into<String>>(mut self, name: S) -> Self {
        self.config.index_hint = name.into();
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
