// 应用核心：主循环持有的全部可变状态
//
// 界面请求以 AppCommand 进入，后台任务结果以 AppEvent 回到主循环，
// 二者都在同一个任务中串行处理；对界面的通知经由 NoticeSink 发出。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::atoms::privilege;
use crate::atoms::settings_store::keys;
use crate::atoms::{ConfigFactory, SettingsStore, SystemProxyController};
use crate::molecules::connection_testing::{
    DEFAULT_CONCURRENCY, PingJob, PingResult, Pinger, SpeedJob, SpeedProgress, SpeedTester,
    SystemPinger, run_ping_batch,
};
use crate::molecules::core_process::{CoreKind, ExitCallback};
use crate::molecules::server_registry::{DeleteOutcome, ServerRegistry, SortColumn, Subscription};
use crate::molecules::subscription_management::{
    SubscriptionEvent, SubscriptionFetcher, SubscriptionInfo, parse_subscription_body,
};
use crate::molecules::system_operations::auto_start;
use crate::molecules::{CoreManager, RoutingMode};
use crate::services::AppContext;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("未选择服务器")]
    NotActivated,
    #[error("配置无效：{0}")]
    InvalidConfig(String),
    #[error("配置缺少 HTTP 入站")]
    NoHttpInbound,
    #[error("{0}")]
    StartFailed(String),
    #[error("VPN 模式需要管理员权限")]
    AdminRequired,
}

// 界面请求
#[derive(Debug, Clone)]
pub enum AppCommand {
    Connect,
    Disconnect,
    Activate(i64),
    ImportShareLinks(String),
    ImportJson { text: String, remark: String },
    ImportFile(PathBuf),
    ExportShareLinks(Vec<usize>),
    Delete(Vec<usize>),
    Duplicate(Vec<usize>),
    Swap(usize, usize),
    Sort { column: SortColumn, reverse: bool },
    PingTest(Vec<usize>),
    SpeedTest(Vec<usize>),
    CancelSpeedTest,
    AddSubscription { remark: String, web_url: String },
    EditSubscription { id: String, remark: String, web_url: String },
    RemoveSubscription(String),
    // id 为空时更新全部订阅
    UpdateSubscriptions { id: Option<String>, use_proxy: bool },
    SetSetting { name: String, value: String },
    Shutdown,
}

// 后台任务回报
#[derive(Debug)]
pub enum AppEvent {
    Ping(PingResult),
    Speed(SpeedProgress),
    Subscription(SubscriptionEvent),
    CoreExited {
        generation: u64,
        kind: CoreKind,
        code: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRow {
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    pub id: String,
    pub remark: String,
    pub web_url: String,
    pub updating: bool,
}

// 发往界面的通知
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Connected { endpoint: String },
    Disconnected,
    ConnectFailed(String),
    CoreExited(String),
    InvalidData,
    Error(String),
    ServersChanged { rows: Vec<ServerRow>, activated: i64 },
    SubscriptionsChanged(Vec<SubscriptionRow>),
    DelayResult { index: usize, result: String },
    SpeedResult { index: usize, result: String, finished: bool },
    SubscriptionUpdated {
        subs_id: String,
        count: usize,
        info: Option<SubscriptionInfo>,
    },
    SubscriptionFailed { subs_id: String, error: String },
    ShareLinks(Vec<String>),
}

pub trait NoticeSink: Send + Sync {
    fn notice(&self, notice: Notice);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionMode {
    SystemProxy,
    Tun,
}

// 把某类后台结果转发进主循环的事件通道
fn forward<T: Send + 'static>(
    events: UnboundedSender<AppEvent>,
    wrap: fn(T) -> AppEvent,
) -> UnboundedSender<T> {
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();

    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if events.send(wrap(item)).is_err() {
                break;
            }
        }
    });

    tx
}

fn read_setting(settings: &mut SettingsStore, name: &str) -> String {
    settings.get(name).unwrap_or_else(|e| {
        log::error!("读取设置失败：{}", e);
        String::new()
    })
}

pub struct AppCore {
    context: AppContext,
    registry: ServerRegistry,
    cores: CoreManager,
    proxy: SystemProxyController,
    speed: Option<SpeedTester>,
    fetcher: SubscriptionFetcher,
    pinger: Arc<dyn Pinger>,
    notices: Arc<dyn NoticeSink>,
    admin_check: fn() -> bool,
    mode: Option<ConnectionMode>,
    // 每次连接递增，过期的核心退出事件据此丢弃
    generation: u64,
    events_tx: UnboundedSender<AppEvent>,
    events: UnboundedReceiver<AppEvent>,
}

impl AppCore {
    pub fn new(context: AppContext, notices: Arc<dyn NoticeSink>) -> Self {
        Self::with_parts(
            context,
            notices,
            SystemProxyController::new(),
            Arc::new(SystemPinger),
        )
    }

    // 需在 tokio 运行时内调用：测速队列与转发任务随之启动
    pub fn with_parts(
        mut context: AppContext,
        notices: Arc<dyn NoticeSink>,
        proxy: SystemProxyController,
        pinger: Arc<dyn Pinger>,
    ) -> Self {
        let servers = read_setting(&mut context.settings, keys::CONFIGURATION);
        let subscriptions = read_setting(&mut context.settings, keys::SUBSCRIPTIONS);
        let legacy = read_setting(&mut context.settings, keys::LEGACY_SUBSCRIPTION);
        let activated = read_setting(&mut context.settings, keys::ACTIVATED_ITEM_INDEX)
            .parse::<i64>()
            .unwrap_or(-1);

        let loaded = ServerRegistry::load(&servers, &subscriptions, &legacy, activated);
        log::info!("已加载 {} 个服务器", loaded.registry.len());

        let (events_tx, events) = mpsc::unbounded_channel();
        let speed = SpeedTester::spawn(
            CoreManager::new(context.paths.clone()),
            forward(events_tx.clone(), AppEvent::Speed),
        );

        let mut core = Self {
            cores: CoreManager::new(context.paths.clone()),
            context,
            registry: loaded.registry,
            proxy,
            speed: Some(speed),
            fetcher: SubscriptionFetcher::new(),
            pinger,
            notices,
            admin_check: privilege::is_admin,
            mode: None,
            generation: 0,
            events_tx,
            events,
        };

        if loaded.migrated_legacy {
            core.save(keys::LEGACY_SUBSCRIPTION, "");
            core.persist_registry();
        }

        core
    }

    pub fn with_core_wait_time(mut self, wait_time: Duration) -> Self {
        self.cores = CoreManager::new(self.context.paths.clone()).with_wait_time(wait_time);
        self
    }

    // VPN 模式的管理员权限检测
    pub fn with_admin_check(mut self, admin_check: fn() -> bool) -> Self {
        self.admin_check = admin_check;
        self
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn settings_mut(&mut self) -> &mut SettingsStore {
        &mut self.context.settings
    }

    pub fn is_connected(&self) -> bool {
        self.mode.is_some()
    }

    pub async fn next_event(&mut self) -> Option<AppEvent> {
        self.events.recv().await
    }

    // 主循环：串行处理命令与事件，直到收到 Shutdown 或命令通道关闭
    pub async fn run(mut self, mut commands: UnboundedReceiver<AppCommand>) {
        enum Step {
            Command(Option<AppCommand>),
            Event(Option<AppEvent>),
        }

        self.publish_all();

        loop {
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                event = self.events.recv() => Step::Event(event),
            };

            match step {
                Step::Command(None) | Step::Command(Some(AppCommand::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Event(Some(event)) => self.handle_event(event).await,
                Step::Event(None) => break,
            }
        }

        self.shutdown().await;
        log::info!("主循环已退出");
    }

    pub async fn handle_command(&mut self, command: AppCommand) {
        match command {
            AppCommand::Connect => {
                if let Err(e) = self.connect().await {
                    self.notify(Notice::ConnectFailed(e.to_string()));
                }
            }
            AppCommand::Disconnect => self.disconnect(),
            AppCommand::Activate(index) => self.activate(index).await,
            AppCommand::ImportShareLinks(text) => self.import_share_links(&text),
            AppCommand::ImportJson { text, remark } => self.import_json(&text, &remark),
            AppCommand::ImportFile(path) => match ConfigFactory::from_file(&path) {
                Ok(factory) => self.import(vec![factory]),
                Err(e) => {
                    log::error!("导入配置文件失败：{}", e);
                    self.notify(Notice::InvalidData);
                }
            },
            AppCommand::ExportShareLinks(indices) => self.export_share_links(&indices),
            AppCommand::Delete(indices) => {
                let outcome = self.registry.delete_by_index(&indices);
                self.after_removal(outcome);
            }
            AppCommand::Duplicate(indices) => {
                self.registry.duplicate(&indices);
                self.registry_changed();
            }
            AppCommand::Swap(i, j) => match self.registry.swap(i, j) {
                Ok(()) => self.registry_changed(),
                Err(e) => log::warn!("交换失败：{}", e),
            },
            AppCommand::Sort { column, reverse } => {
                self.registry.sort_by(column, reverse);
                self.registry_changed();
            }
            AppCommand::PingTest(indices) => self.start_ping(&indices),
            AppCommand::SpeedTest(indices) => self.start_speed_test(&indices),
            AppCommand::CancelSpeedTest => {
                if let Some(speed) = &self.speed {
                    speed.cancel_current();
                }
            }
            AppCommand::AddSubscription { remark, web_url } => {
                let id = self.registry.add_subscription(&remark, &web_url);
                log::info!("已添加订阅 {}：{}", id, remark);
                self.registry_changed();
            }
            AppCommand::EditSubscription {
                id,
                remark,
                web_url,
            } => match self.registry.edit_subscription(&id, &remark, &web_url) {
                Ok(()) => self.registry_changed(),
                Err(e) => self.notify(Notice::Error(e)),
            },
            AppCommand::RemoveSubscription(id) => {
                if self.registry.remove_subscription(&id).is_some() {
                    self.registry_changed();
                }
            }
            AppCommand::UpdateSubscriptions { id, use_proxy } => {
                self.update_subscriptions(id.as_deref(), use_proxy)
            }
            AppCommand::SetSetting { name, value } => self.set_setting(&name, &value).await,
            AppCommand::Shutdown => self.shutdown().await,
        }
    }

    pub async fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Ping(result) => {
                if let Some(index) =
                    self.registry
                        .apply_delay_result(result.index, result.id, &result.result)
                {
                    self.notify(Notice::DelayResult {
                        index,
                        result: result.result,
                    });
                }
            }
            AppEvent::Speed(progress) => {
                if let Some(index) =
                    self.registry
                        .apply_speed_result(progress.index, progress.id, &progress.result)
                {
                    self.notify(Notice::SpeedResult {
                        index,
                        result: progress.result,
                        finished: progress.finished,
                    });
                }
            }
            AppEvent::Subscription(event) => self.on_subscription_event(event),
            AppEvent::CoreExited {
                generation,
                kind,
                code,
            } => {
                if generation != self.generation || !self.is_connected() {
                    log::debug!("忽略过期的核心退出事件：{} {}", kind, code);
                    return;
                }

                let message = CoreManager::exit_reason_message(kind, code);
                log::warn!("连接中的核心退出：{}", message);
                self.disconnect();
                self.notify(Notice::CoreExited(message));
            }
        }
    }

    // 启动激活项对应的核心，并把系统代理（或 tun2socks）指向它；
    // 已连接时先断开旧连接，重连失败则以断开状态结束
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let was_connected = self.stop_connection();
        let result = self.launch_activated().await;

        if result.is_err() && was_connected {
            self.save(keys::CONNECT, "0");
            log::info!("重新连接失败，已断开");
            self.notify(Notice::Disconnected);
        }

        result
    }

    async fn launch_activated(&mut self) -> Result<(), ConnectError> {
        let Some(factory) = self.registry.activated().map(ConfigFactory::deep_copy) else {
            return Err(ConnectError::NotActivated);
        };

        if !factory.is_valid() {
            self.abort_connection();
            return Err(ConnectError::InvalidConfig(factory.item_remark().to_string()));
        }

        let Some(endpoint) = factory.http_proxy_endpoint() else {
            self.abort_connection();
            return Err(ConnectError::NoHttpInbound);
        };

        let vpn = self.setting_on(keys::VPN_MODE);
        let socks = if vpn {
            if !(self.admin_check)() {
                return Err(ConnectError::AdminRequired);
            }
            match factory.socks_proxy_endpoint() {
                Some(socks) => Some(socks),
                None => {
                    self.abort_connection();
                    return Err(ConnectError::InvalidConfig(
                        "VPN 模式需要 SOCKS 入站".to_string(),
                    ));
                }
            }
        } else {
            None
        };

        let routing = RoutingMode::from_name(&read_setting(&mut self.context.settings, keys::ROUTING))
            .unwrap_or_default();

        self.generation += 1;
        let last_exit = Arc::new(Mutex::new(None));
        let callback = self.exit_callback(Arc::clone(&last_exit));

        log::info!("连接 {}（{}，{}）", factory.item_remark(), factory.kind().as_str(), routing);

        let mut started = self
            .cores
            .start(&factory, routing, Some(Arc::clone(&callback)), None)
            .await;

        if started {
            if let Some(socks) = &socks {
                started = self.cores.start_tun(socks, Some(callback), None).await;
            }
        }

        if !started {
            let exit = *last_exit.lock().unwrap_or_else(|e| e.into_inner());
            let message = exit
                .map(|(kind, code)| CoreManager::exit_reason_message(kind, code))
                .unwrap_or_else(|| "核心启动失败".to_string());
            self.abort_connection();
            return Err(ConnectError::StartFailed(message));
        }

        let mode = if socks.is_some() {
            ConnectionMode::Tun
        } else {
            let bypass = read_setting(&mut self.context.settings, keys::PROXY_BYPASS_LIST);
            if let Err(e) = self.proxy.set(&endpoint, &bypass) {
                log::warn!("系统代理未能设置，核心保持运行：{}", e);
            }
            if let Err(e) = self.proxy.daemon_on() {
                log::warn!("启动系统代理守护失败：{}", e);
            }
            ConnectionMode::SystemProxy
        };

        self.mode = Some(mode);
        self.save(keys::CONNECT, "1");
        log::info!("已连接，本地 HTTP 入站：{}", endpoint);
        self.notify(Notice::Connected { endpoint });

        Ok(())
    }

    pub fn disconnect(&mut self) {
        let was_connected = self.stop_connection();
        self.save(keys::CONNECT, "0");

        if was_connected {
            log::info!("已断开连接");
            self.notify(Notice::Disconnected);
        }
    }

    // 上次退出时处于连接状态则自动重连
    pub async fn restore(&mut self) {
        if !self.setting_on(keys::CONNECT) || self.registry.activated().is_none() {
            return;
        }

        log::info!("恢复上次的连接");
        if let Err(e) = self.connect().await {
            self.notify(Notice::ConnectFailed(e.to_string()));
        }
    }

    // 应用退出：停止核心与代理，保留 Connect 设置供下次恢复
    pub async fn shutdown(&mut self) {
        self.stop_connection();

        if let Some(speed) = self.speed.take() {
            speed.shutdown().await;
        }
    }

    fn exit_callback(&self, last_exit: Arc<Mutex<Option<(CoreKind, i64)>>>) -> ExitCallback {
        let events = self.events_tx.clone();
        let generation = self.generation;

        Arc::new(move |kind: CoreKind, code: i64| {
            *last_exit.lock().unwrap_or_else(|e| e.into_inner()) = Some((kind, code));

            if events
                .send(AppEvent::CoreExited {
                    generation,
                    kind,
                    code,
                })
                .is_err()
            {
                log::debug!("主循环已关闭，丢弃核心退出事件");
            }
        })
    }

    // 停止核心并撤销代理；返回此前是否处于连接状态
    fn stop_connection(&mut self) -> bool {
        self.cores.stop_all();

        let Some(mode) = self.mode.take() else {
            return false;
        };

        self.generation += 1;

        if mode == ConnectionMode::SystemProxy {
            self.proxy.daemon_off();
            if let Err(e) = self.proxy.off() {
                log::warn!("清除系统代理失败：{}", e);
            }
        }

        true
    }

    // 连接失败：关闭系统代理并清除激活项
    fn abort_connection(&mut self) {
        self.stop_connection();
        self.proxy.daemon_off();
        if let Err(e) = self.proxy.off() {
            log::warn!("清除系统代理失败：{}", e);
        }

        self.registry.clear_activation();
        self.save(keys::CONNECT, "0");
        self.registry_changed();
    }

    async fn activate(&mut self, index: i64) {
        let previous = self.registry.activated_index();
        if !self.registry.activate(index, true) {
            return;
        }
        self.registry_changed();

        if previous == index || !self.is_connected() {
            return;
        }

        if index < 0 {
            self.disconnect();
        } else if let Err(e) = self.connect().await {
            self.notify(Notice::ConnectFailed(e.to_string()));
        }
    }

    fn import(&mut self, factories: Vec<ConfigFactory>) {
        if factories.is_empty() {
            self.notify(Notice::InvalidData);
            return;
        }

        log::info!("导入 {} 个服务器", factories.len());
        for factory in factories {
            self.registry.append(factory);
        }
        self.registry_changed();
    }

    // 剪贴板文本：逐行分享链接，或整段 base64 订阅内容
    fn import_share_links(&mut self, text: &str) {
        let factories = if text.trim().is_empty() {
            Vec::new()
        } else {
            parse_subscription_body(text)
        };
        self.import(factories);
    }

    fn import_json(&mut self, text: &str, remark: &str) {
        if text.trim().is_empty() {
            self.notify(Notice::InvalidData);
            return;
        }

        match ConfigFactory::from_json_text(text) {
            Ok(factory) => self.import(vec![factory.with_remark(remark)]),
            Err(e) => {
                log::warn!("导入 JSON 失败：{}", e);
                self.notify(Notice::InvalidData);
            }
        }
    }

    fn export_share_links(&mut self, indices: &[usize]) {
        let links: Vec<String> = indices
            .iter()
            .filter_map(|i| self.registry.get(*i))
            .filter_map(|factory| match factory.to_uri() {
                Ok(link) => Some(link),
                Err(e) => {
                    log::warn!("无法生成 {} 的分享链接：{}", factory.item_remark(), e);
                    None
                }
            })
            .collect();

        self.notify(Notice::ShareLinks(links));
    }

    fn after_removal(&mut self, outcome: DeleteOutcome) {
        if outcome.disconnect_requested && self.is_connected() {
            log::info!("激活的服务器已被删除，断开连接");
            self.disconnect();
        }
        self.registry_changed();
    }

    fn targets(&self, indices: &[usize]) -> Vec<usize> {
        if indices.is_empty() {
            (0..self.registry.len()).collect()
        } else {
            indices.to_vec()
        }
    }

    fn start_ping(&mut self, indices: &[usize]) {
        let jobs: Vec<PingJob> = self
            .targets(indices)
            .into_iter()
            .filter_map(|index| {
                self.registry.get(index).map(|factory| PingJob {
                    index,
                    id: factory.id(),
                    address: factory.item_address(),
                    token: factory.deletion_token(),
                })
            })
            .collect();

        let pinger = Arc::clone(&self.pinger);
        let results = forward(self.events_tx.clone(), AppEvent::Ping);

        tokio::spawn(async move {
            run_ping_batch(jobs, pinger, DEFAULT_CONCURRENCY, results).await;
        });
    }

    fn start_speed_test(&mut self, indices: &[usize]) {
        let Some(speed) = &self.speed else {
            log::warn!("测速队列已关闭");
            return;
        };

        for index in self.targets(indices) {
            let Some(factory) = self.registry.get(index) else {
                continue;
            };
            if let Err(e) = speed.enqueue(SpeedJob::new(index, factory)) {
                log::error!("加入测速队列失败：{}", e);
                return;
            }
        }
    }

    fn update_subscriptions(&mut self, id: Option<&str>, use_proxy: bool) {
        let subscriptions: BTreeMap<String, Subscription> = match id {
            Some(id) => self
                .registry
                .subscriptions()
                .iter()
                .filter(|(subs_id, _)| subs_id.as_str() == id)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => self.registry.subscriptions().clone(),
        };

        // 仅在已连接时才能经由本地 HTTP 入站下载
        let proxy = if use_proxy && self.is_connected() {
            self.registry
                .activated()
                .and_then(ConfigFactory::http_proxy_endpoint)
        } else {
            None
        };

        let events = forward(self.events_tx.clone(), AppEvent::Subscription);
        let started = self
            .fetcher
            .update(&subscriptions, proxy.as_deref(), events);

        if !started.is_empty() {
            self.publish_subscriptions();
        }
    }

    fn on_subscription_event(&mut self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Updated {
                subs_id,
                factories,
                info,
            } => {
                if !self.registry.subscriptions().contains_key(&subs_id) {
                    log::warn!("订阅 {} 已被删除，丢弃下载结果", subs_id);
                    return;
                }

                // 没有任何可解析的条目时保留原有条目
                if factories.is_empty() {
                    self.notify(Notice::SubscriptionFailed {
                        subs_id,
                        error: "订阅内容为空或无法解析".to_string(),
                    });
                    self.publish_subscriptions();
                    return;
                }

                let count = factories.len();
                let outcome = self.registry.reconcile_subscription(&subs_id, factories);
                self.after_removal(outcome);
                self.notify(Notice::SubscriptionUpdated {
                    subs_id,
                    count,
                    info,
                });
            }
            SubscriptionEvent::Failed { subs_id, error } => {
                self.notify(Notice::SubscriptionFailed { subs_id, error });
                self.publish_subscriptions();
            }
        }
    }

    async fn set_setting(&mut self, name: &str, value: &str) {
        if let Err(e) = self.context.settings.set(name, value) {
            log::warn!("设置未保存：{}", e);
            self.notify(Notice::Error(e.to_string()));
            return;
        }

        match name {
            keys::STARTUP_ON_BOOT => auto_start::sync_with_setting(value == "1"),
            keys::ROUTING | keys::VPN_MODE if self.is_connected() => {
                log::info!("{} 已变更，重新连接", name);
                if let Err(e) = self.connect().await {
                    self.notify(Notice::ConnectFailed(e.to_string()));
                }
            }
            _ => {}
        }
    }

    fn setting_on(&mut self, name: &str) -> bool {
        self.context.settings.is_on(name).unwrap_or_else(|e| {
            log::error!("读取设置失败：{}", e);
            false
        })
    }

    fn save(&mut self, name: &str, value: &str) {
        if let Err(e) = self.context.settings.set(name, value) {
            log::error!("保存设置 {} 失败：{}", name, e);
        }
    }

    fn persist_registry(&mut self) {
        match self.registry.servers_json() {
            Ok(json) => self.save(keys::CONFIGURATION, &json),
            Err(e) => log::error!("{}", e),
        }
        match self.registry.subscriptions_json() {
            Ok(json) => self.save(keys::SUBSCRIPTIONS, &json),
            Err(e) => log::error!("{}", e),
        }
        let activated = self.registry.activated_index().to_string();
        self.save(keys::ACTIVATED_ITEM_INDEX, &activated);
    }

    fn registry_changed(&mut self) {
        self.persist_registry();
        self.publish_all();
    }

    fn publish_all(&self) {
        self.notify(Notice::ServersChanged {
            rows: self.rows(),
            activated: self.registry.activated_index(),
        });
        self.publish_subscriptions();
    }

    fn publish_subscriptions(&self) {
        let rows = self
            .registry
            .subscriptions()
            .iter()
            .map(|(id, subscription)| SubscriptionRow {
                id: id.clone(),
                remark: subscription.remark.clone(),
                web_url: subscription.web_url.clone(),
                updating: self.fetcher.is_updating(id),
            })
            .collect();

        self.notify(Notice::SubscriptionsChanged(rows));
    }

    fn rows(&self) -> Vec<ServerRow> {
        self.registry
            .factories()
            .iter()
            .map(|factory| ServerRow {
                remark: factory.item_remark().to_string(),
                protocol: factory.item_protocol(),
                address: factory.item_address(),
                port: factory.item_port(),
                transport: factory.item_transport(),
                tls: factory.item_tls(),
                subscription: self
                    .registry
                    .subscriptions()
                    .get(&factory.subs_id)
                    .map(|s| s.remark.clone())
                    .unwrap_or_default(),
                delay: factory.delay_result.clone(),
                speed: factory.speed_result.clone(),
            })
            .collect()
    }

    fn notify(&self, notice: Notice) {
        self.notices.notice(notice);
    }
}
