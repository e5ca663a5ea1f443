// 代理协调器：Dart 信号与主循环之间的桥梁
//
// 每类请求一个监听任务，统一转换为 AppCommand 发往主循环；
// 主循环的通知经 RinfNoticeSink 转为 Rust → Dart 信号。

use anyhow::Context;
use once_cell::sync::Lazy;
use rinf::{DartSignal, RustSignal, SignalPiece};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use super::app_core::{AppCommand, AppCore, Notice, NoticeSink, ServerRow, SubscriptionRow};
use crate::atoms::settings_store::{
    JsonFileBackend, SettingsStore, keys, register_application_settings,
};
use crate::molecules::server_registry::SortColumn;
use crate::molecules::subscription_management::SubscriptionInfo;
use crate::molecules::system_operations::auto_start;
use crate::services::{AppContext, path_service};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// 主循环命令入口与任务句柄
static COMMANDS: Lazy<Mutex<Option<UnboundedSender<AppCommand>>>> =
    Lazy::new(|| Mutex::new(None));
static MAIN_LOOP: Lazy<Mutex<Option<JoinHandle<()>>>> = Lazy::new(|| Mutex::new(None));

// ---------- Dart → Rust ----------

#[derive(Deserialize, DartSignal)]
pub struct ConnectRequest {}

#[derive(Deserialize, DartSignal)]
pub struct DisconnectRequest {}

#[derive(Deserialize, DartSignal)]
pub struct ActivateServer {
    pub index: i64,
}

// 剪贴板内容：分享链接或 base64 订阅内容
#[derive(Deserialize, DartSignal)]
pub struct ImportShareLinks {
    pub text: String,
}

#[derive(Deserialize, DartSignal)]
pub struct ImportJsonConfig {
    pub text: String,
    pub remark: String,
}

#[derive(Deserialize, DartSignal)]
pub struct ImportConfigFile {
    pub path: String,
}

#[derive(Deserialize, DartSignal)]
pub struct ExportShareLinks {
    pub indices: Vec<u32>,
}

#[derive(Deserialize, DartSignal)]
pub struct DeleteServers {
    pub indices: Vec<u32>,
}

#[derive(Deserialize, DartSignal)]
pub struct DuplicateServers {
    pub indices: Vec<u32>,
}

#[derive(Deserialize, DartSignal)]
pub struct SwapServers {
    pub first: u32,
    pub second: u32,
}

// column 取值：Remark / Protocol / Address / Port / Transport / Tls / Subscription / Latency / Speed
#[derive(Deserialize, DartSignal)]
pub struct SortServers {
    pub column: String,
    pub reverse: bool,
}

// indices 为空表示全部
#[derive(Deserialize, DartSignal)]
pub struct PingServers {
    pub indices: Vec<u32>,
}

#[derive(Deserialize, DartSignal)]
pub struct SpeedTestServers {
    pub indices: Vec<u32>,
}

#[derive(Deserialize, DartSignal)]
pub struct CancelSpeedTest {}

#[derive(Deserialize, DartSignal)]
pub struct AddSubscription {
    pub remark: String,
    pub web_url: String,
}

#[derive(Deserialize, DartSignal)]
pub struct EditSubscription {
    pub id: String,
    pub remark: String,
    pub web_url: String,
}

#[derive(Deserialize, DartSignal)]
pub struct RemoveSubscription {
    pub id: String,
}

#[derive(Deserialize, DartSignal)]
pub struct UpdateSubscriptions {
    pub id: Option<String>,
    pub use_proxy: bool,
}

#[derive(Deserialize, DartSignal)]
pub struct ChangeSetting {
    pub name: String,
    pub value: String,
}

// ---------- Rust → Dart ----------

#[derive(Serialize, RustSignal)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub endpoint: Option<String>,
    // 断开原因（用户主动断开时为空）
    pub message: Option<String>,
}

#[derive(Serialize, RustSignal)]
pub struct ConnectionFailed {
    pub message: String,
}

#[derive(Serialize, Clone, Debug, SignalPiece)]
pub struct ServerItem {
    pub remark: String,
    pub protocol: String,
    pub address: String,
    pub port: String,
    pub transport: String,
    pub tls: String,
    pub subscription: String,
    pub delay: String,
    pub speed: String,
}

#[derive(Serialize, RustSignal)]
pub struct ServerList {
    pub servers: Vec<ServerItem>,
    pub activated: i64,
}

#[derive(Serialize, Clone, Debug, SignalPiece)]
pub struct SubscriptionItem {
    pub id: String,
    pub remark: String,
    pub web_url: String,
    pub is_updating: bool,
}

#[derive(Serialize, RustSignal)]
pub struct SubscriptionList {
    pub subscriptions: Vec<SubscriptionItem>,
}

#[derive(Serialize, Clone, Debug, SignalPiece)]
pub struct SubscriptionInfoData {
    pub upload: Option<u64>,
    pub download: Option<u64>,
    pub total: Option<u64>,
    pub expire: Option<i64>,
}

#[derive(Serialize, RustSignal)]
pub struct SubscriptionUpdateResult {
    pub id: String,
    pub is_successful: bool,
    pub server_count: u32,
    pub info: Option<SubscriptionInfoData>,
    pub error_message: Option<String>,
}

#[derive(Serialize, RustSignal)]
pub struct DelayTestResult {
    pub index: u32,
    pub result: String,
}

#[derive(Serialize, RustSignal)]
pub struct SpeedTestProgress {
    pub index: u32,
    pub result: String,
    pub is_finished: bool,
}

#[derive(Serialize, RustSignal)]
pub struct ShareLinksResult {
    pub links: Vec<String>,
}

#[derive(Serialize, RustSignal)]
pub struct InvalidDataNotice {}

#[derive(Serialize, RustSignal)]
pub struct ErrorNotice {
    pub message: String,
}

impl From<ServerRow> for ServerItem {
    fn from(row: ServerRow) -> Self {
        Self {
            remark: row.remark,
            protocol: row.protocol,
            address: row.address,
            port: row.port,
            transport: row.transport,
            tls: row.tls,
            subscription: row.subscription,
            delay: row.delay,
            speed: row.speed,
        }
    }
}

impl From<SubscriptionRow> for SubscriptionItem {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            remark: row.remark,
            web_url: row.web_url,
            is_updating: row.updating,
        }
    }
}

impl From<SubscriptionInfo> for SubscriptionInfoData {
    fn from(info: SubscriptionInfo) -> Self {
        Self {
            upload: info.upload,
            download: info.download,
            total: info.total,
            expire: info.expire,
        }
    }
}

// 将主循环通知转为 Dart 信号
pub struct RinfNoticeSink;

impl NoticeSink for RinfNoticeSink {
    fn notice(&self, notice: Notice) {
        match notice {
            Notice::Connected { endpoint } => ConnectionStatus {
                is_connected: true,
                endpoint: Some(endpoint),
                message: None,
            }
            .send_signal_to_dart(),
            Notice::Disconnected => ConnectionStatus {
                is_connected: false,
                endpoint: None,
                message: None,
            }
            .send_signal_to_dart(),
            Notice::CoreExited(message) => ConnectionStatus {
                is_connected: false,
                endpoint: None,
                message: Some(message),
            }
            .send_signal_to_dart(),
            Notice::ConnectFailed(message) => ConnectionFailed { message }.send_signal_to_dart(),
            Notice::InvalidData => InvalidDataNotice {}.send_signal_to_dart(),
            Notice::Error(message) => ErrorNotice { message }.send_signal_to_dart(),
            Notice::ServersChanged { rows, activated } => ServerList {
                servers: rows.into_iter().map(ServerItem::from).collect(),
                activated,
            }
            .send_signal_to_dart(),
            Notice::SubscriptionsChanged(rows) => SubscriptionList {
                subscriptions: rows.into_iter().map(SubscriptionItem::from).collect(),
            }
            .send_signal_to_dart(),
            Notice::DelayResult { index, result } => DelayTestResult {
                index: index as u32,
                result,
            }
            .send_signal_to_dart(),
            Notice::SpeedResult {
                index,
                result,
                finished,
            } => SpeedTestProgress {
                index: index as u32,
                result,
                is_finished: finished,
            }
            .send_signal_to_dart(),
            Notice::SubscriptionUpdated {
                subs_id,
                count,
                info,
            } => SubscriptionUpdateResult {
                id: subs_id,
                is_successful: true,
                server_count: count as u32,
                info: info.map(SubscriptionInfoData::from),
                error_message: None,
            }
            .send_signal_to_dart(),
            Notice::SubscriptionFailed { subs_id, error } => SubscriptionUpdateResult {
                id: subs_id,
                is_successful: false,
                server_count: 0,
                info: None,
                error_message: Some(error),
            }
            .send_signal_to_dart(),
            Notice::ShareLinks(links) => ShareLinksResult { links }.send_signal_to_dart(),
        }
    }
}

fn sort_column(name: &str) -> Option<SortColumn> {
    let column = match name {
        "Remark" => SortColumn::Remark,
        "Protocol" => SortColumn::Protocol,
        "Address" => SortColumn::Address,
        "Port" => SortColumn::Port,
        "Transport" => SortColumn::Transport,
        "Tls" => SortColumn::Tls,
        "Subscription" => SortColumn::Subscription,
        "Latency" => SortColumn::Latency,
        "Speed" => SortColumn::Speed,
        _ => return None,
    };
    Some(column)
}

fn indices(values: Vec<u32>) -> Vec<usize> {
    values.into_iter().map(|i| i as usize).collect()
}

fn dispatch(command: AppCommand) {
    let commands = COMMANDS.lock().unwrap_or_else(|e| e.into_inner());

    match commands.as_ref() {
        Some(tx) => {
            if tx.send(command).is_err() {
                log::warn!("主循环已退出，丢弃请求");
            }
        }
        None => log::warn!("主循环尚未启动，丢弃请求"),
    }
}

// 为一类 Dart 请求启动监听任务
fn listen<S>(name: &'static str, convert: fn(S) -> Option<AppCommand>)
where
    S: DartSignal + Send + 'static,
{
    spawn(async move {
        let receiver = S::get_dart_signal_receiver();
        while let Some(dart_signal) = receiver.recv().await {
            match convert(dart_signal.message) {
                Some(command) => dispatch(command),
                None => log::warn!("忽略无效的{}请求", name),
            }
        }
        log::info!("{}消息通道已关闭，退出监听器", name);
    });
}

fn init_listeners() {
    listen::<ConnectRequest>("连接", |_| Some(AppCommand::Connect));
    listen::<DisconnectRequest>("断开", |_| Some(AppCommand::Disconnect));
    listen::<ActivateServer>("激活", |r| Some(AppCommand::Activate(r.index)));
    listen::<ImportShareLinks>("导入链接", |r| Some(AppCommand::ImportShareLinks(r.text)));
    listen::<ImportJsonConfig>("导入配置", |r| {
        Some(AppCommand::ImportJson {
            text: r.text,
            remark: r.remark,
        })
    });
    listen::<ImportConfigFile>("导入文件", |r| {
        Some(AppCommand::ImportFile(PathBuf::from(r.path)))
    });
    listen::<ExportShareLinks>("导出链接", |r| {
        Some(AppCommand::ExportShareLinks(indices(r.indices)))
    });
    listen::<DeleteServers>("删除", |r| Some(AppCommand::Delete(indices(r.indices))));
    listen::<DuplicateServers>("复制", |r| Some(AppCommand::Duplicate(indices(r.indices))));
    listen::<SwapServers>("交换", |r| {
        Some(AppCommand::Swap(r.first as usize, r.second as usize))
    });
    listen::<SortServers>("排序", |r| {
        sort_column(&r.column).map(|column| AppCommand::Sort {
            column,
            reverse: r.reverse,
        })
    });
    listen::<PingServers>("延迟测试", |r| Some(AppCommand::PingTest(indices(r.indices))));
    listen::<SpeedTestServers>("测速", |r| Some(AppCommand::SpeedTest(indices(r.indices))));
    listen::<CancelSpeedTest>("取消测速", |_| Some(AppCommand::CancelSpeedTest));
    listen::<AddSubscription>("添加订阅", |r| {
        Some(AppCommand::AddSubscription {
            remark: r.remark,
            web_url: r.web_url,
        })
    });
    listen::<EditSubscription>("编辑订阅", |r| {
        Some(AppCommand::EditSubscription {
            id: r.id,
            remark: r.remark,
            web_url: r.web_url,
        })
    });
    listen::<RemoveSubscription>("删除订阅", |r| Some(AppCommand::RemoveSubscription(r.id)));
    listen::<UpdateSubscriptions>("更新订阅", |r| {
        Some(AppCommand::UpdateSubscriptions {
            id: r.id.filter(|id| !id.is_empty()),
            use_proxy: r.use_proxy,
        })
    });
    listen::<ChangeSetting>("设置", |r| {
        Some(AppCommand::SetSetting {
            name: r.name,
            value: r.value,
        })
    });
}

// 构建应用上下文：路径快照 + JSON 文件设置
fn build_context() -> anyhow::Result<AppContext> {
    let paths = path_service::snapshot();
    paths
        .ensure_dirs()
        .map_err(anyhow::Error::msg)
        .context("准备应用目录失败")?;

    let mut settings = SettingsStore::new(Box::new(JsonFileBackend::open(paths.settings_file())));
    register_application_settings(&mut settings);

    Ok(AppContext::new(paths, settings))
}

// 初始化代理协调器：启动主循环并注册 Dart 请求监听
pub fn init() {
    let mut context = match build_context() {
        Ok(context) => context,
        Err(e) => {
            log::error!("初始化应用上下文失败：{:#}", e);
            return;
        }
    };

    match context.settings.is_on(keys::STARTUP_ON_BOOT) {
        Ok(enabled) => auto_start::sync_with_setting(enabled),
        Err(e) => log::warn!("读取开机自启设置失败：{}", e),
    }

    let (tx, rx) = mpsc::unbounded_channel();
    *COMMANDS.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

    let handle = spawn(async move {
        let mut core = AppCore::new(context, Arc::new(RinfNoticeSink));
        core.restore().await;
        core.run(rx).await;
    });
    *MAIN_LOOP.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

    init_listeners();
}

// 通知主循环退出并等待其停止核心、撤销系统代理
pub async fn cleanup() {
    let sender = COMMANDS.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(tx) = sender {
        if tx.send(AppCommand::Shutdown).is_err() {
            log::debug!("主循环已退出");
        }
    }

    let handle = MAIN_LOOP.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(mut handle) = handle {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
            log::warn!("主循环未在限时内退出，强制中止");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_column_names() {
        assert_eq!(sort_column("Latency"), Some(SortColumn::Latency));
        assert_eq!(sort_column("Tls"), Some(SortColumn::Tls));
        assert_eq!(sort_column("latency"), None);
    }

    #[test]
    fn test_row_conversion() {
        let item = ServerItem::from(ServerRow {
            remark: "A".to_string(),
            protocol: "Trojan".to_string(),
            address: "t.example.com".to_string(),
            port: "443".to_string(),
            transport: "ws".to_string(),
            tls: "tls".to_string(),
            subscription: String::new(),
            delay: "42ms".to_string(),
            speed: String::new(),
        });

        assert_eq!(item.remark, "A");
        assert_eq!(item.delay, "42ms");
    }
}
