//! 网络状态监控
//!
//! ChangeQueue 订阅这里的状态变化：上线解锁推送，离线重新加锁。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::document::now_millis;
use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

impl NetworkStatus {
    /// 能否发出请求
    pub fn is_connected(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 网络状态监听器（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    async fn get_current_status(&self) -> NetworkStatus;

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    async fn stop_monitoring(&self);
}

/// 网络监控管理器
///
/// 默认离线；状态可以由平台监听器推送，也可以由嵌入方通过 `set_status` 直接设置。
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Option<Arc<dyn NetworkStatusListener>>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor {
    pub fn new() -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            listener: None,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Offline)),
        }
    }

    pub fn with_listener(listener: Arc<dyn NetworkStatusListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new()
        }
    }

    /// 启动平台监听（未配置监听器时什么也不做）
    pub async fn start(&self) -> Result<()> {
        let Some(listener) = &self.listener else {
            debug!("未配置网络监听器，网络状态由调用方手动设置");
            return Ok(());
        };

        let initial = listener.get_current_status().await;
        self.set_status(initial).await;

        let mut receiver = listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                *current_status.write().await = event.new_status;
                let _ = status_sender.send(event);
            }
        });

        info!("📡 网络监控已启动 (初始状态: {:?})", initial);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(listener) = &self.listener {
            listener.stop_monitoring().await;
        }
    }

    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态；状态未变化时不广播
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return;
        }

        debug!("网络状态变化: {:?} -> {:?}", old_status, new_status);
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.get_status().await.is_connected()
    }
}


#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;
