// 系统代理原子模块

pub mod controller;
pub mod daemon;
pub mod platform;

pub use controller::{DAEMON_SUPPORTED, SystemProxyController};
pub use daemon::ProxyDaemon;
pub use platform::{OsProxyPlatform, PlatformError, ProxyInfo, ProxyPlatform, ProxySetting};
