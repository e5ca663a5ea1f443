// 系统代理控制器：设置 / 清除 / PAC，以及守护线程的启停

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::daemon::{DEFAULT_CHECK_INTERVAL, ProxyDaemon};
use super::platform::{OsProxyPlatform, PlatformError, ProxyInfo, ProxyPlatform, ProxySetting};

// 仅 Windows 会在会话事件后静默清除代理，其他平台守护线程为空操作
pub const DAEMON_SUPPORTED: bool = cfg!(target_os = "windows");

pub struct SystemProxyController {
    platform: Arc<dyn ProxyPlatform>,
    desired: Arc<Mutex<Option<ProxySetting>>>,
    daemon: Option<ProxyDaemon>,
    daemon_supported: bool,
    check_interval: Duration,
}

impl Default for SystemProxyController {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProxyController {
    pub fn new() -> Self {
        Self::with_platform(Arc::new(OsProxyPlatform), DAEMON_SUPPORTED)
    }

    pub fn with_platform(platform: Arc<dyn ProxyPlatform>, daemon_supported: bool) -> Self {
        Self {
            platform,
            desired: Arc::new(Mutex::new(None)),
            daemon: None,
            daemon_supported,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn daemon_supported(&self) -> bool {
        self.daemon_supported
    }

    fn remember(&self, setting: Option<ProxySetting>) {
        let mut desired = self.desired.lock().unwrap_or_else(|e| {
            log::warn!("期望代理设置锁已中毒，继续使用");
            e.into_inner()
        });
        *desired = setting;
    }

    // 将系统 HTTP/HTTPS 代理指向 host:port
    pub fn set(&self, server: &str, bypass: &str) -> Result<(), String> {
        let setting = ProxySetting::Server {
            server: server.to_string(),
            bypass: bypass.to_string(),
        };
        self.remember(Some(setting.clone()));

        self.platform.apply(&setting).map_err(|e| {
            log::error!("设置系统代理失败：{}", e);
            e.to_string()
        })
    }

    // 使用自动配置脚本
    pub fn pac(&self, url: &str) -> Result<(), String> {
        let setting = ProxySetting::Pac {
            url: url.to_string(),
        };
        self.remember(Some(setting.clone()));

        self.platform.apply(&setting).map_err(|e| {
            log::error!("设置 PAC 代理失败：{}", e);
            e.to_string()
        })
    }

    // 清除系统代理；辅助程序缺失时视为成功
    pub fn off(&self) -> Result<(), String> {
        self.remember(None);

        match self.platform.clear() {
            Ok(()) => Ok(()),
            Err(PlatformError::HelperMissing(helper)) => {
                log::debug!("系统代理辅助程序不可用（{}），跳过清除", helper);
                Ok(())
            }
            Err(e) => {
                log::error!("清除系统代理失败：{}", e);
                Err(e.to_string())
            }
        }
    }

    // 幂等：至多启动一个守护线程
    pub fn daemon_on(&mut self) -> Result<(), String> {
        if !self.daemon_supported {
            log::debug!("当前平台无需系统代理守护线程");
            return Ok(());
        }

        if self.daemon.as_ref().is_some_and(ProxyDaemon::is_running) {
            return Ok(());
        }

        let daemon = ProxyDaemon::spawn(
            Arc::clone(&self.platform),
            Arc::clone(&self.desired),
            self.check_interval,
        )?;
        self.daemon = Some(daemon);
        Ok(())
    }

    // 停止并等待守护线程；未运行时为空操作
    pub fn daemon_off(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.stop();
        }
    }

    pub fn is_daemon_running(&self) -> bool {
        self.daemon.as_ref().is_some_and(ProxyDaemon::is_running)
    }

    pub fn get_proxy_info(&self) -> ProxyInfo {
        self.platform.query()
    }
}
