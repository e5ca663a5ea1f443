// 延迟测试：并发受限的 ICMP 探测

use futures_util::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::atoms::{DeletionToken, FactoryId};
use crate::services::is_exiting;

pub const PING_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CONCURRENCY: usize = 16;

pub const RESULT_TIMEOUT: &str = "Timeout";
pub const RESULT_ERROR: &str = "Error";

// 无应答时 ping 的退出码；其余非零退出码视为错误
#[cfg(target_os = "macos")]
pub const NO_REPLY_EXIT_CODE: i32 = 2;
#[cfg(not(target_os = "macos"))]
pub const NO_REPLY_EXIT_CODE: i32 = 1;

// Windows 的解析失败同样以 1 退出，需按输出区分
const ERROR_MARKERS: &[&str] = &[
    "unknown host",
    "name or service not known",
    "temporary failure in name resolution",
    "no address associated",
    "cannot resolve",
    "could not find host",
    "bad address",
    "找不到主机",
];

// time=12.3 ms / time<1ms / 时间=12ms
static LATENCY_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(?:time|时间)\s*[=<]\s*([\d.]+)\s*ms").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Latency(u64),
    Timeout,
    Error,
}

impl PingOutcome {
    pub fn label(self) -> String {
        match self {
            PingOutcome::Latency(ms) => format!("{}ms", ms),
            PingOutcome::Timeout => RESULT_TIMEOUT.to_string(),
            PingOutcome::Error => RESULT_ERROR.to_string(),
        }
    }
}

pub trait Pinger: Send + Sync + 'static {
    fn ping(&self, host: &str, timeout: Duration) -> PingOutcome;
}

// 调用系统 ping 命令
pub struct SystemPinger;

impl SystemPinger {
    fn command(host: &str, timeout: Duration) -> Command {
        let mut command = Command::new("ping");

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            use winapi::um::winbase::CREATE_NO_WINDOW;

            command
                .args(["-n", "1", "-w"])
                .arg(timeout.as_millis().to_string())
                .creation_flags(CREATE_NO_WINDOW);
        }

        #[cfg(target_os = "macos")]
        command
            .args(["-c", "1", "-t"])
            .arg(timeout.as_secs().max(1).to_string());

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        command
            .args(["-c", "1", "-W"])
            .arg(timeout.as_secs().max(1).to_string());

        command
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

// 中文 Windows 控制台输出为 GBK
#[cfg(target_os = "windows")]
fn decode_output(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => encoding_rs::GBK.decode(bytes).0.into_owned(),
    }
}

#[cfg(not(target_os = "windows"))]
fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn parse_latency(output: &str) -> Option<u64> {
    let pattern = LATENCY_PATTERN.as_ref()?;
    let value: f64 = pattern.captures(output)?.get(1)?.as_str().parse().ok()?;
    Some(value.round() as u64)
}

// 根据退出码与输出判定结果：有延迟即成功，无应答为超时，其余为错误
pub fn classify_output(exit_code: Option<i32>, stdout: &str, stderr: &str) -> PingOutcome {
    if let Some(ms) = parse_latency(stdout) {
        return PingOutcome::Latency(ms);
    }

    let text = format!("{}\n{}", stdout, stderr).to_lowercase();
    if ERROR_MARKERS.iter().any(|marker| text.contains(marker)) {
        return PingOutcome::Error;
    }

    match exit_code {
        Some(NO_REPLY_EXIT_CODE) => PingOutcome::Timeout,
        Some(code) => {
            log::debug!("ping 异常退出，退出码：{}，{}", code, stderr.trim());
            PingOutcome::Error
        }
        None => PingOutcome::Error,
    }
}

impl Pinger for SystemPinger {
    fn ping(&self, host: &str, timeout: Duration) -> PingOutcome {
        if host.is_empty() {
            return PingOutcome::Error;
        }

        let output = match Self::command(host, timeout).output() {
            Ok(output) => output,
            Err(e) => {
                log::warn!("执行 ping 失败：{}", e);
                return PingOutcome::Error;
            }
        };

        let stdout = decode_output(&output.stdout);
        let stderr = decode_output(&output.stderr);
        classify_output(output.status.code(), &stdout, &stderr)
    }
}

// 单个探测任务：下标提示 + 稳定句柄 + 删除标记
#[derive(Debug, Clone)]
pub struct PingJob {
    pub index: usize,
    pub id: FactoryId,
    pub address: String,
    pub token: DeletionToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    pub index: usize,
    pub id: FactoryId,
    pub result: String,
}

// 批量延迟测试（滑动窗口并发，结果无序）。
// 返回实际回报的结果数量；已删除的目标被跳过。
pub async fn run_ping_batch(
    jobs: Vec<PingJob>,
    pinger: Arc<dyn Pinger>,
    concurrency: usize,
    events: UnboundedSender<PingResult>,
) -> usize {
    if jobs.is_empty() {
        log::warn!("批量延迟测试：目标列表为空");
        return 0;
    }

    let total = jobs.len();
    log::info!("开始批量延迟测试，目标数：{}，并发数：{}", total, concurrency);

    let reported = stream::iter(jobs)
        .map(|job| {
            let pinger = Arc::clone(&pinger);
            let events = events.clone();

            async move {
                if job.token.is_deleted() {
                    return false;
                }

                let address = job.address.clone();
                let outcome = tokio::task::spawn_blocking(move || pinger.ping(&address, PING_TIMEOUT))
                    .await
                    .unwrap_or_else(|e| {
                        log::error!("延迟测试任务执行失败：{}", e);
                        PingOutcome::Error
                    });

                // 测试期间被删除或应用正在退出时不再回报
                if job.token.is_deleted() || is_exiting() {
                    return false;
                }

                log::debug!("{} 延迟：{:?}", job.address, outcome);

                events
                    .send(PingResult {
                        index: job.index,
                        id: job.id,
                        result: outcome.label(),
                    })
                    .is_ok()
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter(|reported| futures_util::future::ready(*reported))
        .count()
        .await;

    log::info!("批量延迟测试完成，回报：{}/{}", reported, total);
    reported
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::{ConfigFactory, ConfigKind};
    use serde_json::json;

    struct FakePinger;

    impl Pinger for FakePinger {
        fn ping(&self, host: &str, _timeout: Duration) -> PingOutcome {
            match host {
                "fast.example.com" => PingOutcome::Latency(12),
                "" => PingOutcome::Error,
                _ => PingOutcome::Timeout,
            }
        }
    }

    fn job(index: usize, factory: &ConfigFactory) -> PingJob {
        PingJob {
            index,
            id: factory.id(),
            address: factory.item_address(),
            token: factory.deletion_token(),
        }
    }

    #[test]
    fn test_parse_latency() {
        assert_eq!(
            parse_latency("64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.6 ms"),
            Some(13)
        );
        assert_eq!(
            parse_latency("Reply from 1.1.1.1: bytes=32 time<1ms TTL=57"),
            Some(1)
        );
        assert_eq!(
            parse_latency("Reply from 1.1.1.1: bytes=32 time=23ms TTL=57"),
            Some(23)
        );
        assert_eq!(parse_latency("Request timed out."), None);
    }

    #[test]
    fn test_classify_output() {
        assert_eq!(
            classify_output(Some(0), "64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=8.2 ms", ""),
            PingOutcome::Latency(8)
        );
        assert_eq!(
            classify_output(
                Some(NO_REPLY_EXIT_CODE),
                "1 packets transmitted, 0 received, 100% packet loss, time 0ms",
                ""
            ),
            PingOutcome::Timeout
        );
        assert_eq!(
            classify_output(Some(2), "", "ping: nosuch.invalid: Name or service not known"),
            PingOutcome::Error
        );
        assert_eq!(
            classify_output(
                Some(NO_REPLY_EXIT_CODE),
                "Ping request could not find host nosuch.invalid. Please check the name and try again.",
                ""
            ),
            PingOutcome::Error
        );
        assert_eq!(
            classify_output(Some(68), "", "ping: cannot resolve nosuch.invalid: Unknown host"),
            PingOutcome::Error
        );
        assert_eq!(classify_output(Some(NO_REPLY_EXIT_CODE + 1), "", ""), PingOutcome::Error);
        assert_eq!(classify_output(None, "", ""), PingOutcome::Error);
    }

    #[test]
    fn test_labels() {
        assert_eq!(PingOutcome::Latency(5).label(), "5ms");
        assert_eq!(PingOutcome::Timeout.label(), "Timeout");
        assert_eq!(PingOutcome::Error.label(), "Error");
    }

    #[tokio::test]
    async fn test_batch_skips_deleted_targets() {
        let fast = ConfigFactory::from_json(ConfigKind::Hysteria2, json!({ "server": "fast.example.com:443" }));
        let slow = ConfigFactory::from_json(ConfigKind::Hysteria2, json!({ "server": "slow.example.com:443" }));
        let gone = ConfigFactory::from_json(ConfigKind::Hysteria2, json!({ "server": "fast.example.com:443" }));
        gone.mark_deleted();

        let jobs = vec![job(0, &fast), job(1, &slow), job(2, &gone)];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let reported = run_ping_batch(jobs, Arc::new(FakePinger), 4, tx).await;
        assert_eq!(reported, 2);

        let mut results = Vec::new();
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }
        results.sort_by_key(|r| r.index);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, fast.id());
        assert_eq!(results[0].result, "12ms");
        assert_eq!(results[1].result, "Timeout");
    }
}
