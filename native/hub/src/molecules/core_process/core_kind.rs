// 外部核心种类：可执行文件名、启动参数与退出码表

use serde_json::Value;
use std::fmt;
use std::path::Path;

use crate::atoms::ConfigKind;

// 服务启动失败的平台哨兵值
#[cfg(target_os = "windows")]
pub const SERVER_START_FAILURE_CODE: i64 = 4_294_967_295;
#[cfg(not(target_os = "windows"))]
pub const SERVER_START_FAILURE_CODE: i64 = 255;

pub const CONFIGURATION_ERROR_CODE: i64 = 23;
pub const REMOTE_NETWORK_ERROR_CODE: i64 = 3;
pub const SYSTEM_SHUTTING_DOWN_CODE: i64 = 0x4001_0004;

// 被信号终止等无退出码的情况
pub const UNKNOWN_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreKind {
    Xray,
    Hysteria1,
    Hysteria2,
    Tun2socks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ConfigurationError,
    ServerStartFailure,
    RemoteNetworkError,
    SystemShuttingDown,
}

impl ExitReason {
    pub fn name(self) -> &'static str {
        match self {
            ExitReason::ConfigurationError => "ConfigurationError",
            ExitReason::ServerStartFailure => "ServerStartFailure",
            ExitReason::RemoteNetworkError => "RemoteNetworkError",
            ExitReason::SystemShuttingDown => "SystemShuttingDown",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<ConfigKind> for CoreKind {
    fn from(kind: ConfigKind) -> Self {
        match kind {
            ConfigKind::Xray => CoreKind::Xray,
            ConfigKind::Hysteria1 => CoreKind::Hysteria1,
            ConfigKind::Hysteria2 => CoreKind::Hysteria2,
        }
    }
}

impl CoreKind {
    pub fn name(self) -> &'static str {
        match self {
            CoreKind::Xray => "Xray",
            CoreKind::Hysteria1 => "Hysteria1",
            CoreKind::Hysteria2 => "Hysteria2",
            CoreKind::Tun2socks => "Tun2socks",
        }
    }

    // cores 目录下的可执行文件名（不含扩展名）
    pub fn executable_name(self) -> &'static str {
        match self {
            CoreKind::Xray => "xray",
            CoreKind::Hysteria1 => "hysteria",
            CoreKind::Hysteria2 => "hysteria2",
            CoreKind::Tun2socks => "tun2socks",
        }
    }

    // 启动参数；tun2socks 不读取配置文件，参数取自配置中的 device / proxy
    pub fn args(self, config_path: &Path, config: &Value) -> Vec<String> {
        let path = config_path.to_string_lossy().to_string();

        match self {
            CoreKind::Xray => vec!["run".to_string(), "-c".to_string(), path],
            CoreKind::Hysteria1 => vec!["-c".to_string(), path, "client".to_string()],
            CoreKind::Hysteria2 => vec!["client".to_string(), "-c".to_string(), path],
            CoreKind::Tun2socks => {
                let field = |key: &str| {
                    config
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                let mut args = vec![
                    "-device".to_string(),
                    field("device"),
                    "-proxy".to_string(),
                    field("proxy"),
                ];
                let level = field("loglevel");
                if !level.is_empty() {
                    args.push("-loglevel".to_string());
                    args.push(level);
                }
                args
            }
        }
    }

    pub fn exit_codes(self) -> &'static [(ExitReason, i64)] {
        match self {
            CoreKind::Xray => &[
                (ExitReason::ConfigurationError, CONFIGURATION_ERROR_CODE),
                (ExitReason::ServerStartFailure, SERVER_START_FAILURE_CODE),
            ],
            CoreKind::Hysteria1 => &[
                (ExitReason::ConfigurationError, CONFIGURATION_ERROR_CODE),
                (ExitReason::ServerStartFailure, SERVER_START_FAILURE_CODE),
                (ExitReason::RemoteNetworkError, REMOTE_NETWORK_ERROR_CODE),
            ],
            CoreKind::Hysteria2 => &[
                (ExitReason::ConfigurationError, CONFIGURATION_ERROR_CODE),
                (ExitReason::ServerStartFailure, SERVER_START_FAILURE_CODE),
                (ExitReason::SystemShuttingDown, SYSTEM_SHUTTING_DOWN_CODE),
            ],
            CoreKind::Tun2socks => &[
                (ExitReason::ServerStartFailure, SERVER_START_FAILURE_CODE),
                (ExitReason::SystemShuttingDown, SYSTEM_SHUTTING_DOWN_CODE),
            ],
        }
    }

    // 退出码仅作参考：未登记的值返回 None
    pub fn exit_reason(self, code: i64) -> Option<ExitReason> {
        self.exit_codes()
            .iter()
            .find(|(_, value)| *value == code)
            .map(|(reason, _)| *reason)
    }
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exit_code_tables() {
        assert_eq!(
            CoreKind::Xray.exit_reason(23),
            Some(ExitReason::ConfigurationError)
        );
        assert_eq!(
            CoreKind::Hysteria1.exit_reason(3),
            Some(ExitReason::RemoteNetworkError)
        );
        assert_eq!(CoreKind::Xray.exit_reason(3), None);
        assert_eq!(
            CoreKind::Tun2socks.exit_reason(SYSTEM_SHUTTING_DOWN_CODE),
            Some(ExitReason::SystemShuttingDown)
        );
        assert_eq!(CoreKind::Tun2socks.exit_reason(23), None);
        assert_eq!(
            CoreKind::Hysteria2.exit_reason(SERVER_START_FAILURE_CODE),
            Some(ExitReason::ServerStartFailure)
        );
    }

    #[test]
    fn test_args() {
        let path = Path::new("/tmp/c.json");

        assert_eq!(
            CoreKind::Xray.args(path, &json!({})),
            vec!["run", "-c", "/tmp/c.json"]
        );
        assert_eq!(
            CoreKind::Hysteria2.args(path, &json!({})),
            vec!["client", "-c", "/tmp/c.json"]
        );
        assert_eq!(
            CoreKind::Tun2socks.args(
                path,
                &json!({ "device": "tun://skylark", "proxy": "socks5://127.0.0.1:10808" })
            ),
            vec!["-device", "tun://skylark", "-proxy", "socks5://127.0.0.1:10808"]
        );
    }
}
