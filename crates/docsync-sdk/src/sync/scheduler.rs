//! 定时同步
//!
//! 周期性执行一轮完整同步；失败或临时失败时按固定延迟（带随机抖动）重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// 一轮同步任务
#[async_trait]
pub trait SyncJob: Send + Sync {
    /// 返回 Ok(false) 表示有列遇到临时失败，需要稍后重试
    async fn run_once(&self) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct SyncScheduler {
    interval: Duration,
    retry_delay_ms: u64,
    retry_jitter: f64,
}

impl SyncScheduler {
    pub fn new(interval: Duration, retry_delay_ms: u64, retry_jitter: f64) -> Self {
        Self {
            interval,
            retry_delay_ms,
            retry_jitter: retry_jitter.clamp(0.0, 1.0),
        }
    }

    /// 固定重试延迟 ± 抖动
    pub fn retry_delay(&self) -> Duration {
        let base = self.retry_delay_ms as f64;
        let jitter = base * self.retry_jitter * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }

    /// 运行直到 `shutdown` 被取消
    pub async fn run(&self, job: Arc<dyn SyncJob>, shutdown: CancellationToken) {
        info!("⏱️ 定时同步已启动 (间隔 {:?})", self.interval);
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delay = match job.run_once().await {
                Ok(true) => self.interval,
                Ok(false) => {
                    let delay = self.retry_delay();
                    debug!("本轮同步未完成，{:?} 后重试", delay);
                    delay
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.retry_delay();
                    warn!("同步失败，{:?} 后重试: {}", delay, e);
                    delay
                }
                Err(e) => {
                    error!("❌ 同步失败: {}", e);
                    self.interval
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        info!("定时同步已停止");
    }
}
