//! 网络状态监视
//!
//! 在线标志保存在 `watch` 通道中；调度器在运行任务前等待在线，
//! 运行中断网则取消本次运行。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::remote::RemoteStore;

/// 网络状态监视器（可廉价克隆）
#[derive(Clone)]
pub struct NetworkMonitor {
    online: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(watch::channel(online).0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// 更新在线状态；状态未变化时不通知订阅者
    pub fn set_online(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            info!(
                "[Sync::Network] Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub async fn wait_until_online(&self) {
        let mut rx = self.subscribe();
        // 发送端由 self 持有，wait_for 不会因关闭而失败
        let _ = rx.wait_for(|online| *online).await;
    }

    pub async fn wait_until_offline(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|online| !*online).await;
    }

    /// 启动连通性探测：按固定间隔调用 `check_connection` 更新在线状态
    pub fn spawn_probe(
        &self,
        remote: Arc<dyn RemoteStore>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = remote.check_connection().await;
                        if let Err(e) = &reachable {
                            debug!("[Sync::Network] Probe against {} failed: {}", remote.provider_name(), e);
                        }
                        monitor.set_online(reachable.is_ok());
                    }
                }
            }
            debug!("[Sync::Network] Probe stopped");
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;

    #[tokio::test]
    async fn test_wait_until_online_resolves_after_set() {
        let monitor = NetworkMonitor::new(false);
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_until_online().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        monitor.set_online(true);
        waiter.await.unwrap();
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_tracks_remote_reachability() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_offline(true);
        let monitor = NetworkMonitor::new(true);
        let cancel = CancellationToken::new();
        let handle = monitor.spawn_probe(remote.clone(), Duration::from_secs(5), cancel.clone());

        monitor.wait_until_offline().await;
        assert!(!monitor.is_online());

        remote.set_offline(false);
        monitor.wait_until_online().await;

        cancel.cancel();
        handle.await.unwrap();
    }
}
