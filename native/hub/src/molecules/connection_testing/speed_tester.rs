// 下载测速：单运行者 FIFO 队列，每次只运行一个测速核心

use futures_util::StreamExt;
use reqwest::{Client, Proxy};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::atoms::{ConfigFactory, ConfigKind, DeletionToken, FactoryId};
use crate::molecules::core_manager::CoreManager;
use crate::molecules::core_process::{CoreKind, ExitCallback, ExitReason};
use crate::molecules::routing::RoutingMode;
use crate::services::is_exiting;

pub const SPEED_TEST_LISTEN: &str = "127.0.0.1";
pub const SPEED_TEST_PORT: u16 = 20809;
pub const SPEED_TEST_URL: &str = "https://speed.cloudflare.com/__down?bytes=104857600";
pub const QUEUE_TICK: Duration = Duration::from_millis(250);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const RENAMED_PROXY_TAG: &str = "proxy20809";

pub const LABEL_CANCELED: &str = "Canceled";
pub const LABEL_START_FAILED: &str = "Start failed";
pub const LABEL_INVALID: &str = "Invalid";

#[derive(Debug)]
pub struct SpeedJob {
    pub index: usize,
    pub id: FactoryId,
    // 派发时的配置快照
    pub factory: ConfigFactory,
    pub token: DeletionToken,
}

impl SpeedJob {
    pub fn new(index: usize, factory: &ConfigFactory) -> Self {
        Self {
            index,
            id: factory.id(),
            factory: factory.deep_copy(),
            token: factory.deletion_token(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeedProgress {
    pub index: usize,
    pub id: FactoryId,
    pub result: String,
    pub finished: bool,
}

// 改写为仅含 127.0.0.1:20809 HTTP 入站的测速配置
pub fn prepare_config(factory: &ConfigFactory) -> Result<Value, String> {
    let mut config = factory
        .json()
        .cloned()
        .ok_or_else(|| "配置不是有效的 JSON".to_string())?;
    let root = config
        .as_object_mut()
        .ok_or_else(|| "配置不是 JSON 对象".to_string())?;

    match factory.kind() {
        ConfigKind::Xray => {
            root.insert(
                "inbounds".to_string(),
                json!([{
                    "tag": "http",
                    "port": SPEED_TEST_PORT,
                    "listen": SPEED_TEST_LISTEN,
                    "protocol": "http",
                    "settings": {},
                }]),
            );

            if let Some(outbounds) = root.get_mut("outbounds").and_then(Value::as_array_mut) {
                for outbound in outbounds.iter_mut() {
                    if outbound.get("tag").and_then(Value::as_str) == Some("proxy") {
                        outbound["tag"] = json!(RENAMED_PROXY_TAG);
                    }
                }
            }
        }
        ConfigKind::Hysteria1 | ConfigKind::Hysteria2 => {
            // 避免与正在连接的核心争用 SOCKS 端口
            root.remove("socks5");
            root.insert(
                "http".to_string(),
                json!({ "listen": format!("{}:{}", SPEED_TEST_LISTEN, SPEED_TEST_PORT) }),
            );
        }
    }

    Ok(config)
}

// 核心退出时立即终止当前任务的标签
fn exit_label(kind: CoreKind, code: i64) -> Option<&'static str> {
    match kind.exit_reason(code)? {
        ExitReason::ConfigurationError => Some(LABEL_INVALID),
        ExitReason::ServerStartFailure => Some(LABEL_START_FAILED),
        _ => None,
    }
}

fn error_name(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "TimeoutError"
    } else if error.is_connect() {
        "ProxyConnectionRefusedError"
    } else if error.is_status() {
        "ContentAccessDenied"
    } else if error.is_body() || error.is_decode() {
        "RemoteHostClosedError"
    } else {
        "UnknownNetworkError"
    }
}

fn format_speed(bytes: u64, elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64().max(0.001);
    format!("{:.2} M/s", bytes as f64 / seconds / 1024.0 / 1024.0)
}

// 当前任务的取消标记；标记在任务开始时清除，核心启动期间的取消同样生效
#[derive(Default)]
struct CancelSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    // 先登记等待再检查标记，避免错过检查与等待之间的取消
    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

struct JobContext<'a> {
    job: &'a SpeedJob,
    events: &'a UnboundedSender<SpeedProgress>,
}

impl JobContext<'_> {
    // 目标被删除或应用退出时不再回报
    fn emit(&self, result: &str, finished: bool) -> bool {
        if self.job.token.is_deleted() || is_exiting() {
            return false;
        }

        self.events
            .send(SpeedProgress {
                index: self.job.index,
                id: self.job.id,
                result: result.to_string(),
                finished,
            })
            .is_ok()
    }
}

async fn download(
    context: &JobContext<'_>,
    url: &str,
    cancel: &CancelSignal,
    exits: &mut UnboundedReceiver<(CoreKind, i64)>,
) -> Result<String, String> {
    let proxy = Proxy::all(format!("http://{}:{}", SPEED_TEST_LISTEN, SPEED_TEST_PORT))
        .map_err(|_| "UnknownNetworkError".to_string())?;
    let client = Client::builder()
        .proxy(proxy)
        .timeout(DOWNLOAD_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|_| "UnknownNetworkError".to_string())?;

    let started_at = Instant::now();
    let mut received: u64 = 0;
    let mut last_result: Option<String> = None;
    let mut last_emit = Instant::now();

    // 已有结果时保留最后的速度，否则返回失败标签
    let finish = |label: String, last: Option<String>| match last {
        Some(result) => Ok(result),
        None => Err(label),
    };

    let response = tokio::select! {
        response = client.get(url).send() => response,
        _ = cancel.cancelled() => return Err(LABEL_CANCELED.to_string()),
        Some((kind, code)) = exits.recv() => {
            return Err(exit_label(kind, code).unwrap_or(LABEL_START_FAILED).to_string());
        }
    };

    let response = match response.and_then(|r| r.error_for_status()) {
        Ok(response) => response,
        Err(e) => {
            log::warn!("测速请求失败：{}", e);
            return Err(error_name(&e).to_string());
        }
    };

    let mut stream = response.bytes_stream();

    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    received += bytes.len() as u64;
                    let result = format_speed(received, started_at.elapsed());
                    if last_emit.elapsed() >= PROGRESS_INTERVAL {
                        if !context.emit(&result, false) {
                            return Err(LABEL_CANCELED.to_string());
                        }
                        last_emit = Instant::now();
                    }
                    last_result = Some(result);
                }
                Some(Err(e)) => {
                    log::warn!("测速下载中断：{}", e);
                    return finish(error_name(&e).to_string(), last_result);
                }
                None => {
                    return finish(LABEL_START_FAILED.to_string(), last_result);
                }
            },
            _ = cancel.cancelled() => {
                return finish(LABEL_CANCELED.to_string(), last_result);
            }
            Some((kind, code)) = exits.recv() => {
                if let Some(label) = exit_label(kind, code) {
                    return Err(label.to_string());
                }
                return finish(format!("{}Exited", kind), last_result);
            }
        }
    }
}

async fn run_job(
    job: SpeedJob,
    manager: &mut CoreManager,
    cancel: &CancelSignal,
    events: &UnboundedSender<SpeedProgress>,
    url: &str,
) {
    let context = JobContext { job: &job, events };

    if job.token.is_deleted() {
        log::debug!("测速目标已删除，跳过");
        return;
    }

    let config = match prepare_config(&job.factory) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("测速配置无效：{}", e);
            context.emit(LABEL_INVALID, true);
            return;
        }
    };

    let (exit_tx, mut exits) = mpsc::unbounded_channel();
    let exit_callback: ExitCallback = Arc::new(move |kind: CoreKind, code: i64| {
        let _ = exit_tx.send((kind, code));
    });

    let factory = ConfigFactory::from_json(job.factory.kind(), config);
    let started = manager
        .start(&factory, RoutingMode::Global, Some(exit_callback), None)
        .await;

    if !started {
        let label = match exits.try_recv() {
            Ok((kind, code)) => exit_label(kind, code).unwrap_or(LABEL_START_FAILED),
            Err(_) => LABEL_START_FAILED,
        };
        manager.stop_all();
        context.emit(label, true);
        return;
    }

    if cancel.is_requested() {
        manager.stop_all();
        log::info!("测速已在核心启动期间取消 [{}]", job.index);
        context.emit(LABEL_CANCELED, true);
        return;
    }

    let result = match download(&context, url, cancel, &mut exits).await {
        Ok(speed) => speed,
        Err(label) => label,
    };

    manager.stop_all();
    log::info!("测速完成 [{}]：{}", job.index, result);
    context.emit(&result, true);
}

pub struct SpeedTester {
    queue: UnboundedSender<SpeedJob>,
    cancel: Arc<CancelSignal>,
    closing: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    runner: Option<JoinHandle<()>>,
}

impl SpeedTester {
    // 启动唯一的运行者，独占自己的核心管理器
    pub fn spawn(manager: CoreManager, events: UnboundedSender<SpeedProgress>) -> Self {
        Self::spawn_with_url(manager, events, SPEED_TEST_URL)
    }

    pub fn spawn_with_url(
        mut manager: CoreManager,
        events: UnboundedSender<SpeedProgress>,
        url: &str,
    ) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<SpeedJob>();
        let cancel = Arc::new(CancelSignal::default());
        let closing = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));
        let url = url.to_string();

        let runner = {
            let cancel = Arc::clone(&cancel);
            let closing = Arc::clone(&closing);
            let busy = Arc::clone(&busy);

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(QUEUE_TICK);
                loop {
                    ticker.tick().await;
                    if closing.load(Ordering::SeqCst) {
                        break;
                    }

                    match rx.try_recv() {
                        Ok(job) => {
                            cancel.reset();
                            busy.store(true, Ordering::SeqCst);
                            run_job(job, &mut manager, &cancel, &events, &url).await;
                            busy.store(false, Ordering::SeqCst);
                        }
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => break,
                    }
                }
                manager.stop_all();
                log::debug!("测速队列已退出");
            })
        };

        Self {
            queue,
            cancel,
            closing,
            busy,
            runner: Some(runner),
        }
    }

    pub fn enqueue(&self, job: SpeedJob) -> Result<(), String> {
        self.queue
            .send(job)
            .map_err(|_| "测速队列已关闭".to_string())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    // 取消当前任务；排队中的任务不受影响
    pub fn cancel_current(&self) {
        if self.is_busy() {
            self.cancel.request();
        }
    }

    // 停止队列；最多等待 5 秒后强制中止
    pub async fn shutdown(mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.cancel.request();

        let Some(mut runner) = self.runner.take() else {
            return;
        };

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut runner).await.is_err() {
            log::warn!("测速任务未在限时内结束，强制中止");
            runner.abort();
        }
    }
}

impl Drop for SpeedTester {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            runner.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::PathService;

    fn tester(root: &std::path::Path) -> (SpeedTester, UnboundedReceiver<SpeedProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = CoreManager::new(PathService::with_root(root));
        (SpeedTester::spawn(manager, tx), rx)
    }

    #[test]
    fn test_prepare_xray_config() {
        let factory = ConfigFactory::from_json(
            ConfigKind::Xray,
            json!({
                "inbounds": [{ "protocol": "socks", "port": 10808 }, { "protocol": "http", "port": 10809 }],
                "outbounds": [{ "tag": "proxy", "protocol": "vless" }, { "tag": "direct", "protocol": "freedom" }],
            }),
        );

        let config = prepare_config(&factory).unwrap();
        let inbounds = config["inbounds"].as_array().unwrap();

        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0]["port"], SPEED_TEST_PORT);
        assert_eq!(inbounds[0]["protocol"], "http");
        assert_eq!(config["outbounds"][0]["tag"], "proxy20809");
        assert_eq!(config["outbounds"][1]["tag"], "direct");
        // 原配置不受影响
        assert_eq!(factory.json().unwrap()["outbounds"][0]["tag"], "proxy");
    }

    #[test]
    fn test_prepare_hysteria_config() {
        let factory = ConfigFactory::from_json(
            ConfigKind::Hysteria2,
            json!({ "server": "h:443", "socks5": { "listen": "127.0.0.1:10808" }, "http": { "listen": "127.0.0.1:10809" } }),
        );

        let config = prepare_config(&factory).unwrap();
        assert_eq!(config["http"]["listen"], "127.0.0.1:20809");
        assert!(config.get("socks5").is_none());

        assert!(prepare_config(&ConfigFactory::from_text(ConfigKind::Hysteria2, "oops")).is_err());
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(2 * 1024 * 1024, Duration::from_secs(1)), "2.00 M/s");
        assert_eq!(format_speed(3 * 1024 * 1024, Duration::from_secs(2)), "1.50 M/s");
    }

    #[tokio::test]
    async fn test_invalid_config_is_labeled_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let (tester, mut rx) = tester(dir.path());

        let factory = ConfigFactory::from_text(ConfigKind::Xray, "{ invalid json");
        tester.enqueue(SpeedJob::new(4, &factory)).unwrap();

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.index, 4);
        assert_eq!(progress.id, factory.id());
        assert_eq!(progress.result, "Invalid");
        assert!(progress.finished);

        // 未写出任何核心配置
        assert!(!dir.path().join("data").exists());

        tester.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let (tester, mut rx) = tester(dir.path());

        let invalid = ConfigFactory::from_text(ConfigKind::Xray, "");
        // 核心程序不存在，启动失败
        let missing_core = ConfigFactory::from_json(ConfigKind::Hysteria2, json!({ "server": "h:443" }));

        tester.enqueue(SpeedJob::new(0, &invalid)).unwrap();
        tester.enqueue(SpeedJob::new(1, &missing_core)).unwrap();
        tester.enqueue(SpeedJob::new(2, &invalid)).unwrap();

        let results: Vec<(usize, String)> = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|p| (p.index, p.result))
        .collect();

        assert_eq!(
            results,
            vec![
                (0, "Invalid".to_string()),
                (1, "Start failed".to_string()),
                (2, "Invalid".to_string()),
            ]
        );

        tester.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_while_core_starts() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cores = dir.path().join("cores");
        std::fs::create_dir_all(&cores).unwrap();
        let core = cores.join("hysteria2");
        std::fs::write(&core, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&core, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = CoreManager::new(PathService::with_root(dir.path()))
            .with_wait_time(Duration::from_millis(800));
        // 下载地址不可达：若取消丢失，结果会是网络错误而非 Canceled
        let tester = SpeedTester::spawn_with_url(manager, tx, "http://127.0.0.1:9/");

        let factory = ConfigFactory::from_json(ConfigKind::Hysteria2, json!({ "server": "h:443" }));
        tester.enqueue(SpeedJob::new(0, &factory)).unwrap();

        while !tester.is_busy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tester.cancel_current();

        let progress = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.result, LABEL_CANCELED);
        assert!(progress.finished);

        tester.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleted_target_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (tester, mut rx) = tester(dir.path());

        let gone = ConfigFactory::from_text(ConfigKind::Xray, "");
        let kept = ConfigFactory::from_text(ConfigKind::Xray, "");
        let gone_job = SpeedJob::new(0, &gone);
        gone.mark_deleted();

        tester.enqueue(gone_job).unwrap();
        tester.enqueue(SpeedJob::new(1, &kept)).unwrap();

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.index, 1);

        tester.shutdown().await;
    }
}
