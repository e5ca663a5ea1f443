// 核心管理门面：按配置种类选择核心、物化路由并维护进程池

use serde_json::json;
use std::time::Duration;

use crate::atoms::{ConfigFactory, ConfigKind};
use crate::molecules::core_process::{
    CoreKind, CoreSupervisor, DEFAULT_WAIT_TIME, ExitCallback, ExitReason, MessageCallback,
    StartOptions,
};
use crate::molecules::routing::{RoutingMode, apply_hysteria1_rules, hysteria1_rules, materialize_xray};
use crate::services::PathService;

pub const TUN_DEVICE: &str = "tun://skylark";

pub struct CoreManager {
    paths: PathService,
    pool: Vec<CoreSupervisor>,
    wait_time: Duration,
}

impl CoreManager {
    pub fn new(paths: PathService) -> Self {
        Self {
            paths,
            pool: Vec::new(),
            wait_time: DEFAULT_WAIT_TIME,
        }
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn paths(&self) -> &PathService {
        &self.paths
    }

    fn supervisor(&self, kind: CoreKind) -> CoreSupervisor {
        let supervisor = CoreSupervisor::new(
            kind,
            self.paths.core_binary(kind.executable_name()),
            self.paths.app_data_dir(),
        );

        match kind {
            CoreKind::Xray => supervisor.with_asset_dir(self.paths.assets_dir()),
            _ => supervisor,
        }
    }

    // 启动配置对应的核心；配置副本在启动前按路由模式改写
    pub async fn start(
        &mut self,
        factory: &ConfigFactory,
        routing: RoutingMode,
        exit_callback: Option<ExitCallback>,
        message_callback: Option<MessageCallback>,
    ) -> bool {
        let Some(json) = factory.json() else {
            log::error!("配置不是有效的 JSON，无法启动核心");
            return false;
        };

        let kind = CoreKind::from(factory.kind());
        let mut config = json.clone();
        let mut supervisor = self.supervisor(kind);

        let materialized = match factory.kind() {
            ConfigKind::Xray => materialize_xray(&mut config, routing, self.paths.install_root()),
            ConfigKind::Hysteria1 => {
                let rules = hysteria1_rules(
                    &config,
                    routing,
                    self.paths.assets_dir(),
                    self.paths.install_root(),
                );
                let stem = supervisor
                    .config_path()
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "hysteria".to_string());
                apply_hysteria1_rules(&mut config, &rules, self.paths.app_data_dir(), &stem).map(
                    |written| {
                        for path in written {
                            supervisor.track_file(path);
                        }
                    },
                )
            }
            ConfigKind::Hysteria2 => Ok(()),
        };

        if let Err(e) = materialized {
            log::error!("物化路由失败：{}", e);
            return false;
        }

        self.launch(supervisor, &config, exit_callback, message_callback)
            .await
    }

    // 启动 tun2socks，将系统流量转发到本地 SOCKS 入站
    pub async fn start_tun(
        &mut self,
        socks_endpoint: &str,
        exit_callback: Option<ExitCallback>,
        message_callback: Option<MessageCallback>,
    ) -> bool {
        let config = json!({
            "device": TUN_DEVICE,
            "proxy": format!("socks5://{}", socks_endpoint),
            "loglevel": "info",
        });

        let supervisor = self.supervisor(CoreKind::Tun2socks);
        self.launch(supervisor, &config, exit_callback, message_callback)
            .await
    }

    async fn launch(
        &mut self,
        mut supervisor: CoreSupervisor,
        config: &serde_json::Value,
        exit_callback: Option<ExitCallback>,
        message_callback: Option<MessageCallback>,
    ) -> bool {
        let kind = supervisor.kind();
        let started = supervisor
            .start(
                config,
                StartOptions {
                    wait_time: self.wait_time,
                    exit_callback,
                    message_callback,
                },
            )
            .await;

        if started {
            log::info!("{} 核心运行中，当前进程池：{} 个", kind, self.pool.len() + 1);
        }

        self.pool.push(supervisor);
        started
    }

    pub fn stop_all(&mut self) {
        for supervisor in self.pool.iter_mut() {
            supervisor.stop();
        }
        self.pool.clear();
    }

    pub fn all_running(&self) -> bool {
        !self.pool.is_empty() && self.pool.iter().all(CoreSupervisor::is_running)
    }

    pub fn any_running(&self) -> bool {
        self.pool.iter().any(CoreSupervisor::is_running)
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    // 将常见退出码映射为提示信息
    pub fn exit_reason_message(kind: CoreKind, code: i64) -> String {
        match kind.exit_reason(code) {
            Some(ExitReason::ConfigurationError) => format!("{} 配置无效，核心拒绝启动", kind),
            Some(ExitReason::ServerStartFailure) => {
                format!("{} 启动失败，本地端口可能已被占用", kind)
            }
            Some(ExitReason::RemoteNetworkError) => "与服务器的连接已断开".to_string(),
            Some(ExitReason::SystemShuttingDown) => "系统正在关机".to_string(),
            None => format!("{} 意外退出，退出码：{}", kind, code),
        }
    }
}

impl Drop for CoreManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
