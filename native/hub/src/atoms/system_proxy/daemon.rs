// 系统代理守护线程
//
// 会话切换等系统事件可能清除代理设置，守护线程定期检查并重新应用期望设置。

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::platform::{ProxyPlatform, ProxySetting};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

pub struct ProxyDaemon {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ProxyDaemon {
    pub fn spawn(
        platform: Arc<dyn ProxyPlatform>,
        desired: Arc<Mutex<Option<ProxySetting>>>,
        interval: Duration,
    ) -> Result<Self, String> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("system-proxy-daemon".to_string())
            .spawn(move || {
                log::info!("系统代理守护线程已启动");

                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // 收到停止信号或控制器已释放
                        _ => break,
                    }

                    let setting = desired
                        .lock()
                        .unwrap_or_else(|e| {
                            log::warn!("期望代理设置锁已中毒，继续使用");
                            e.into_inner()
                        })
                        .clone();

                    let Some(setting) = setting else {
                        continue;
                    };

                    if platform.query().satisfies(&setting) {
                        continue;
                    }

                    log::warn!("检测到系统代理被清除，正在重新应用");
                    if let Err(e) = platform.apply(&setting) {
                        log::error!("重新应用系统代理失败：{}", e);
                    }
                }

                log::info!("系统代理守护线程已退出");
            })
            .map_err(|e| format!("无法启动系统代理守护线程：{}", e))?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    // 停止并等待线程退出
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("系统代理守护线程异常退出");
        }
    }
}

impl Drop for ProxyDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
