// 核心进程监督：启动、输出泵、存活检查与退出回调
//
// 状态机：Idle → Starting → Running → Stopping → Idle；
// 启动后立即退出时 Starting → Idle 并触发退出回调。

use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::core_kind::{CoreKind, UNKNOWN_EXIT_CODE};
#[cfg(target_os = "windows")]
use super::job_object::JobObject;

pub const MESSAGE_INTERVAL: Duration = Duration::from_millis(250);
pub const DAEMON_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_millis(2000);

const LIVENESS_POLL: Duration = Duration::from_millis(50);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(3);

// 参数模板中的配置文件占位符
pub const CONFIG_PLACEHOLDER: &str = "{config}";

// 运行期退出的回调在守护计时器的 tokio 任务中调用，不在调用方的主循环上；
// 需要串行处理的调用方应将其转发到自己的事件通道
pub type ExitCallback = Arc<dyn Fn(CoreKind, i64) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(CoreKind, &str) + Send + Sync>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
}

pub struct StartOptions {
    pub wait_time: Duration,
    pub exit_callback: Option<ExitCallback>,
    pub message_callback: Option<MessageCallback>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            wait_time: DEFAULT_WAIT_TIME,
            exit_callback: None,
            message_callback: None,
        }
    }
}

// 一次启动的生命周期状态
struct Life {
    state: SupervisorState,
    child: Option<Child>,
    // 触发时取出，保证每次启动至多回调一次
    exit_callback: Option<ExitCallback>,
    #[cfg(target_os = "windows")]
    job: Option<JobObject>,
}

impl Life {
    fn new() -> Self {
        Self {
            state: SupervisorState::Idle,
            child: None,
            exit_callback: None,
            #[cfg(target_os = "windows")]
            job: None,
        }
    }

    fn reset(&mut self) {
        self.state = SupervisorState::Idle;
        self.child = None;
        #[cfg(target_os = "windows")]
        {
            self.job = None;
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    // 子进程已退出时返回退出码并重置进程状态
    fn reap_if_exited(&mut self) -> Option<i64> {
        let child = self.child.as_mut()?;

        let code = match child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => exit_code_of(status),
            Err(e) => {
                log::warn!("查询核心进程状态失败：{}", e);
                UNKNOWN_EXIT_CODE
            }
        };

        self.reset();
        Some(code)
    }
}

fn lock(life: &Mutex<Life>) -> MutexGuard<'_, Life> {
    life.lock().unwrap_or_else(|e| {
        log::warn!("核心进程状态锁已中毒，继续使用");
        e.into_inner()
    })
}

fn exit_code_of(status: ExitStatus) -> i64 {
    match status.code() {
        // Windows 退出码为 DWORD
        #[cfg(target_os = "windows")]
        Some(code) => i64::from(code as u32),
        #[cfg(not(target_os = "windows"))]
        Some(code) => i64::from(code),
        None => UNKNOWN_EXIT_CODE,
    }
}

// 检查存活；观察到退出时在锁外触发一次退出回调
fn observe_exit(life: &Mutex<Life>, kind: CoreKind) -> bool {
    let (code, callback) = {
        let mut life = lock(life);
        match life.reap_if_exited() {
            Some(code) => (code, life.exit_callback.take()),
            None => return life.child.is_some(),
        }
    };

    log::warn!("{} 核心已退出，退出码：{}", kind, code);

    if let Some(callback) = callback {
        callback(kind, code);
    }

    false
}

pub struct CoreSupervisor {
    kind: CoreKind,
    executable: PathBuf,
    work_dir: PathBuf,
    asset_dir: Option<PathBuf>,
    args_template: Option<Vec<String>>,
    instance: u64,
    config: Option<Value>,
    // 本实例写出的文件，停止时删除
    files: Vec<PathBuf>,
    life: Arc<Mutex<Life>>,
    message_timer: Option<JoinHandle<()>>,
    daemon_timer: Option<JoinHandle<()>>,
}

impl CoreSupervisor {
    pub fn new(kind: CoreKind, executable: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            executable: executable.into(),
            work_dir: work_dir.into(),
            asset_dir: None,
            args_template: None,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            config: None,
            files: Vec::new(),
            life: Arc::new(Mutex::new(Life::new())),
            message_timer: None,
            daemon_timer: None,
        }
    }

    // Xray 子进程通过 XRAY_LOCATION_ASSET 查找 geosite / geoip
    pub fn with_asset_dir(mut self, asset_dir: impl Into<PathBuf>) -> Self {
        self.asset_dir = Some(asset_dir.into());
        self
    }

    // 覆盖默认参数；{config} 替换为配置文件路径
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args_template = Some(args);
        self
    }

    pub fn kind(&self) -> CoreKind {
        self.kind
    }

    // 最近一次启动登记的配置
    pub fn config(&self) -> Option<&Value> {
        self.config.as_ref()
    }

    pub fn config_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("{}_{}.json", self.kind.executable_name(), self.instance))
    }

    // 登记随本实例启动写出的附属文件（如 ACL / mmdb）
    pub fn track_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    pub fn state(&self) -> SupervisorState {
        lock(&self.life).state
    }

    pub fn is_running(&self) -> bool {
        lock(&self.life).is_alive()
    }

    // 额外在观察到退出时触发一次退出回调，并重置进程状态
    pub fn check_is_running(&mut self) -> bool {
        let alive = observe_exit(&self.life, self.kind);
        if !alive {
            if let Some(timer) = self.daemon_timer.take() {
                timer.abort();
            }
        }
        alive
    }

    pub async fn start(&mut self, config: &Value, options: StartOptions) -> bool {
        if lock(&self.life).child.is_some() {
            log::warn!("{} 核心已在运行，先停止旧进程", self.kind);
            self.stop();
        }

        self.config = Some(config.clone());
        lock(&self.life).state = SupervisorState::Starting;

        let config_path = self.config_path();
        self.track_file(config_path.clone());
        if let Err(e) = write_config(&config_path, config) {
            log::error!("写入 {} 配置失败：{}", self.kind, e);
            lock(&self.life).reset();
            return false;
        }

        let mut child = match self.spawn_child(&config_path, config) {
            Ok(child) => child,
            Err(e) => {
                log::error!("启动 {} 核心失败：{}", self.kind, e);
                lock(&self.life).reset();
                return false;
            }
        };

        log::info!("{} 核心已启动，PID：{}", self.kind, child.id());

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone(), self.kind);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx, self.kind);
        }

        {
            #[cfg(target_os = "windows")]
            let job = match JobObject::assign(&child) {
                Ok(job) => Some(job),
                Err(e) => {
                    log::warn!("无法将核心进程加入 Job Object：{}", e);
                    None
                }
            };

            let mut life = lock(&self.life);
            life.child = Some(child);
            life.exit_callback = options.exit_callback;
            #[cfg(target_os = "windows")]
            {
                life.job = job;
            }
        }

        self.message_timer = Some(spawn_message_timer(
            rx,
            self.kind,
            options.message_callback,
        ));

        // 协作式等待核心进入稳定状态
        let deadline = Instant::now() + options.wait_time;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(LIVENESS_POLL.min(deadline - now)).await;
            if !lock(&self.life).is_alive() {
                break;
            }
        }

        if !observe_exit(&self.life, self.kind) {
            log::error!("{} 核心启动后立即退出", self.kind);
            return false;
        }

        lock(&self.life).state = SupervisorState::Running;
        self.daemon_timer = Some(spawn_daemon_timer(Arc::clone(&self.life), self.kind));

        true
    }

    fn spawn_child(&self, config_path: &Path, config: &Value) -> Result<Child, String> {
        let args = match &self.args_template {
            Some(template) => {
                let path = config_path.to_string_lossy();
                template
                    .iter()
                    .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &path))
                    .collect()
            }
            None => self.kind.args(config_path, config),
        };

        log::debug!("启动参数：{} {:?}", self.executable.display(), args);

        let mut command = Command::new(&self.executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.kind == CoreKind::Xray {
            if let Some(asset_dir) = &self.asset_dir {
                command.env("XRAY_LOCATION_ASSET", asset_dir);
            }
        }

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            use winapi::um::winbase::CREATE_NO_WINDOW;

            command.creation_flags(CREATE_NO_WINDOW);
        }

        command
            .spawn()
            .map_err(|e| format!("{}：{}", self.executable.display(), e))
    }

    // 幂等：停止计时器、终止子进程、记录退出码并删除写出的文件
    pub fn stop(&mut self) {
        if let Some(timer) = self.daemon_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.message_timer.take() {
            timer.abort();
        }

        let child = {
            let mut life = lock(&self.life);
            // 主动停止不触发退出回调
            life.exit_callback = None;
            let child = life.child.take();
            if child.is_some() {
                life.state = SupervisorState::Stopping;
            }
            child
        };

        if let Some(child) = child {
            terminate(child, self.kind);
        }

        lock(&self.life).reset();
        self.remove_files();
    }

    fn remove_files(&mut self) {
        for path in self.files.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("已删除 {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("删除 {} 失败：{}", path.display(), e),
            }
        }
    }
}

impl Drop for CoreSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_config(path: &Path, config: &Value) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("创建目录失败：{}", e))?;
    }

    let text = serde_json::to_string_pretty(config).map_err(|e| format!("序列化失败：{}", e))?;
    std::fs::write(path, text).map_err(|e| format!("{}：{}", path.display(), e))
}

// 后台线程逐行读取子进程输出
fn spawn_reader<R: Read + Send + 'static>(stream: R, tx: Sender<String>, kind: CoreKind) {
    let result = std::thread::Builder::new()
        .name(format!("{}-output", kind.executable_name()))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });

    if let Err(e) = result {
        log::warn!("创建 {} 输出读取线程失败：{}", kind, e);
    }
}

// 消息计时器：每个周期非阻塞地取出全部输出行；输出流关闭后退出
fn spawn_message_timer(
    rx: Receiver<String>,
    kind: CoreKind,
    callback: Option<MessageCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MESSAGE_INTERVAL);
        loop {
            ticker.tick().await;
            loop {
                match rx.try_recv() {
                    Ok(line) => {
                        log::debug!("[{}] {}", kind, line);
                        if let Some(callback) = &callback {
                            callback(kind, &line);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
        }
    })
}

// 守护计时器：周期检查存活，观察到退出后结束；退出回调在本任务中执行
fn spawn_daemon_timer(life: Arc<Mutex<Life>>, kind: CoreKind) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DAEMON_INTERVAL);
        // 首个 tick 立即完成
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !observe_exit(&life, kind) {
                break;
            }
        }
    })
}

#[cfg(unix)]
fn terminate(mut child: Child, kind: CoreKind) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    log::info!("正在停止 {} 核心，PID：{}", kind, pid);

    if let Err(e) = kill(pid, Signal::SIGTERM) {
        log::debug!("发送 SIGTERM 失败：{}", e);
    }

    let deadline = Instant::now() + TERMINATE_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                log::info!("{} 核心已停止，退出码：{}", kind, exit_code_of(status));
                return;
            }
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(None) => {
                log::warn!("{} 核心未响应 SIGTERM，强制结束", kind);
                if let Err(e) = child.kill() {
                    log::error!("强制结束 {} 核心失败：{}", kind, e);
                }
                break;
            }
            Err(e) => {
                log::error!("等待 {} 核心退出失败：{}", kind, e);
                break;
            }
        }
    }

    match child.wait() {
        Ok(status) => log::info!("{} 核心已停止，退出码：{}", kind, exit_code_of(status)),
        Err(e) => log::error!("等待 {} 核心退出失败：{}", kind, e),
    }
}

#[cfg(not(unix))]
fn terminate(mut child: Child, kind: CoreKind) {
    log::info!("正在停止 {} 核心，PID：{}", kind, child.id());

    if let Err(e) = child.kill() {
        log::debug!("结束 {} 核心失败：{}", kind, e);
    }

    match child.wait() {
        Ok(status) => log::info!("{} 核心已停止，退出码：{}", kind, exit_code_of(status)),
        Err(e) => log::error!("等待 {} 核心退出失败：{}", kind, e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn shell(script: &str, dir: &Path) -> CoreSupervisor {
        CoreSupervisor::new(CoreKind::Xray, "/bin/sh", dir)
            .with_args(vec!["-c".to_string(), script.to_string()])
    }

    fn counting_callback() -> (ExitCallback, Arc<AtomicUsize>, Arc<Mutex<Vec<i64>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let codes = Arc::new(Mutex::new(Vec::new()));
        let callback: ExitCallback = {
            let count = Arc::clone(&count);
            let codes = Arc::clone(&codes);
            Arc::new(move |_: CoreKind, code: i64| {
                count.fetch_add(1, Ordering::SeqCst);
                codes.lock().unwrap().push(code);
            })
        };
        (callback, count, codes)
    }

    #[tokio::test]
    async fn test_start_pump_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell("echo hello; exec sleep 30", dir.path());

        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let message_callback: MessageCallback = {
            let lines = Arc::clone(&lines);
            Arc::new(move |_: CoreKind, line: &str| lines.lock().unwrap().push(line.to_string()))
        };
        let (exit_callback, exits, _) = counting_callback();

        let started = supervisor
            .start(
                &json!({ "log": {} }),
                StartOptions {
                    wait_time: Duration::from_millis(300),
                    exit_callback: Some(exit_callback),
                    message_callback: Some(message_callback),
                },
            )
            .await;

        assert!(started);
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert!(supervisor.is_running());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(lines.lock().unwrap().iter().any(|l| l == "hello"));

        supervisor.stop();
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        // 主动停止不触发退出回调
        assert_eq!(exits.load(Ordering::SeqCst), 0);

        supervisor.stop();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_immediate_exit_fires_callback_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell("exit 23", dir.path());
        let (exit_callback, exits, codes) = counting_callback();

        let started = supervisor
            .start(
                &json!({}),
                StartOptions {
                    wait_time: Duration::from_millis(500),
                    exit_callback: Some(exit_callback),
                    message_callback: None,
                },
            )
            .await;

        assert!(!started);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(codes.lock().unwrap().as_slice(), &[23]);

        assert!(!supervisor.check_is_running());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_death_detected_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell("sleep 0.4; exit 3", dir.path());
        let (exit_callback, exits, codes) = counting_callback();

        let started = supervisor
            .start(
                &json!({}),
                StartOptions {
                    wait_time: Duration::from_millis(50),
                    exit_callback: Some(exit_callback),
                    message_callback: None,
                },
            )
            .await;
        assert!(started);

        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert!(!supervisor.check_is_running());
        assert!(!supervisor.check_is_running());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(codes.lock().unwrap().as_slice(), &[3]);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_config_is_registered_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = CoreSupervisor::new(CoreKind::Xray, "/bin/sh", dir.path()).with_args(
            vec!["-c".to_string(), "cat \"$0\"; exec sleep 30".to_string(), CONFIG_PLACEHOLDER.to_string()],
        );
        let config = json!({ "inbounds": [], "outbounds": [] });

        assert!(
            supervisor
                .start(
                    &config,
                    StartOptions {
                        wait_time: Duration::from_millis(100),
                        ..Default::default()
                    },
                )
                .await
        );

        assert_eq!(supervisor.config(), Some(&config));
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(supervisor.config_path()).unwrap()).unwrap();
        assert_eq!(written, config);

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_stop_removes_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell("exec sleep 30", dir.path());
        let extra = dir.path().join("rules.acl");
        std::fs::write(&extra, b"direct all").unwrap();
        supervisor.track_file(&extra);

        assert!(
            supervisor
                .start(
                    &json!({}),
                    StartOptions {
                        wait_time: Duration::from_millis(100),
                        ..Default::default()
                    },
                )
                .await
        );
        let config_path = supervisor.config_path();
        assert!(config_path.exists());

        supervisor.stop();
        assert!(!config_path.exists());
        assert!(!extra.exists());

        // 启动失败后停止同样清理
        let mut failed = shell("exit 23", dir.path());
        assert!(
            !failed
                .start(
                    &json!({}),
                    StartOptions {
                        wait_time: Duration::from_millis(300),
                        ..Default::default()
                    },
                )
                .await
        );
        assert!(failed.config_path().exists());
        failed.stop();
        assert!(!failed.config_path().exists());
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor =
            CoreSupervisor::new(CoreKind::Hysteria2, dir.path().join("missing-core"), dir.path());

        assert!(!supervisor.start(&json!({}), StartOptions::default()).await);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }
}
