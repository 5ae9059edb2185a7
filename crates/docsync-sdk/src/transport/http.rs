//! HTTP 传输实现 - 基于 reqwest（rustls，无 OpenSSL）

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, error, info};

use super::{ApiPath, Transport};
use crate::config::HttpClientConfig;
use crate::error::{DocSyncError, Result};

/// HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &HttpClientConfig, base_url: &str, auth_token: Option<String>) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(DocSyncError::Config("api_url 不能为空".to_string()));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| DocSyncError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!("✅ HTTP 传输已创建 (base_url: {})", base_url);
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    pub fn url_for(&self, path: ApiPath) -> String {
        format!("{}/{}", self.base_url, path.as_str())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, path: ApiPath, body: serde_json::Value) -> Result<Option<serde_json::Value>> {
        let url = self.url_for(path);
        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DocSyncError::Transport(format!("请求 {} 失败: {}", path, e)))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ {} 失败，HTTP 状态码: {}, 错误: {}", path, status, error_text);
            return Err(DocSyncError::Transport(format!(
                "{} 失败，HTTP 状态码: {} ({})",
                path, status, error_text
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| DocSyncError::Transport(format!("读取 {} 响应失败: {}", path, e)))?;
        if text.trim().is_empty() {
            debug!("{} 返回空响应", path);
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| DocSyncError::MalformedResponse(format!("{} 响应不是合法 JSON: {}", path, e)))?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(value))
    }
}
