// 订阅下载器
// 拉取订阅内容，解码为分享链接并交回主循环对账

use reqwest::{Client, Proxy};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::atoms::ConfigFactory;
use crate::atoms::share_link::{self, decode_base64_lenient};
use crate::molecules::server_registry::Subscription;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_USER_AGENT: &str = "Skylark/0.1 (subscription)";

// 订阅流量信息（subscription-userinfo 响应头）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub upload: Option<u64>,
    pub download: Option<u64>,
    pub total: Option<u64>,
    pub expire: Option<i64>,
}

// 下载任务回报给主循环的事件
#[derive(Debug)]
pub enum SubscriptionEvent {
    Updated {
        subs_id: String,
        factories: Vec<ConfigFactory>,
        info: Option<SubscriptionInfo>,
    },
    Failed {
        subs_id: String,
        error: String,
    },
}

// 进行中的订阅标识；守卫释放时移除
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

struct InFlightGuard {
    set: InFlight,
    subs_id: String,
}

impl InFlight {
    fn try_begin(&self, subs_id: &str) -> Option<InFlightGuard> {
        let mut set = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(subs_id.to_string()) {
            return None;
        }

        Some(InFlightGuard {
            set: self.clone(),
            subs_id: subs_id.to_string(),
        })
    }

    fn contains(&self, subs_id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(subs_id)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.0.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.subs_id);
    }
}

pub struct SubscriptionFetcher {
    in_flight: InFlight,
    user_agent: String,
    timeout: Duration,
}

impl Default for SubscriptionFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionFetcher {
    pub fn new() -> Self {
        Self {
            in_flight: InFlight::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_updating(&self, subs_id: &str) -> bool {
        self.in_flight.contains(subs_id)
    }

    // 为每个订阅启动一个下载任务，返回实际启动的订阅标识。
    // 同一订阅已有任务在运行时忽略本次触发。
    pub fn update(
        &self,
        subscriptions: &BTreeMap<String, Subscription>,
        http_proxy: Option<&str>,
        events: UnboundedSender<SubscriptionEvent>,
    ) -> Vec<String> {
        let mut started = Vec::new();

        for (subs_id, subscription) in subscriptions {
            let Some(guard) = self.in_flight.try_begin(subs_id) else {
                log::debug!("订阅 {} 正在更新，忽略重复请求", subs_id);
                continue;
            };

            let subs_id = subs_id.clone();
            let url = subscription.web_url.clone();
            let proxy = http_proxy.map(str::to_string);
            let user_agent = self.user_agent.clone();
            let timeout = self.timeout;
            let events = events.clone();

            started.push(subs_id.clone());

            tokio::spawn(async move {
                let _guard = guard;

                let event = match download_subscription(&url, proxy.as_deref(), &user_agent, timeout).await
                {
                    Ok((content, info)) => {
                        let factories = parse_subscription_body(&content);
                        log::info!("订阅 {} 下载成功，解析出 {} 个节点", subs_id, factories.len());
                        SubscriptionEvent::Updated {
                            subs_id,
                            factories,
                            info,
                        }
                    }
                    Err(e) => {
                        log::error!("订阅 {} 下载失败：{}", subs_id, e);
                        SubscriptionEvent::Failed { subs_id, error: e }
                    }
                };

                if events.send(event).is_err() {
                    log::debug!("主循环已关闭，丢弃订阅结果");
                }
            });
        }

        started
    }
}

// 下载订阅内容并返回正文与订阅信息
pub async fn download_subscription(
    url: &str,
    http_proxy: Option<&str>,
    user_agent: &str,
    timeout: Duration,
) -> Result<(String, Option<SubscriptionInfo>), String> {
    log::info!("开始下载订阅：{}", url);

    let client = create_http_client(http_proxy, timeout)?;

    let response = client
        .get(url)
        .header("User-Agent", user_agent)
        .send()
        .await
        .map_err(|e| format!("请求失败：{}", e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        ));
    }

    let subscription_info = parse_subscription_info(response.headers());
    if let Some(ref info) = subscription_info {
        log::info!(
            "订阅流量：上传 {:?}，下载 {:?}，总量 {:?}，到期 {:?}",
            info.upload,
            info.download,
            info.total,
            info.expire
        );
    }

    let content = response
        .text()
        .await
        .map_err(|e| format!("读取响应失败：{}", e))?;

    if content.trim().is_empty() {
        return Err("订阅内容为空".to_string());
    }

    Ok((content, subscription_info))
}

// 创建 HTTP 客户端；未指定代理时直连
fn create_http_client(http_proxy: Option<&str>, timeout: Duration) -> Result<Client, String> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10));

    match http_proxy {
        Some(endpoint) => {
            log::debug!("通过本地代理下载：{}", endpoint);
            let proxy = Proxy::all(format!("http://{}", endpoint))
                .map_err(|e| format!("代理地址无效：{}", e))?;
            builder = builder.proxy(proxy);
        }
        None => {
            builder = builder.no_proxy();
        }
    }

    builder.build().map_err(|e| format!("创建 HTTP 客户端失败：{}", e))
}

// 解码订阅正文；非 Base64 内容按纯文本链接列表处理。
// 无法解析的行记录警告后丢弃。
pub fn parse_subscription_body(content: &str) -> Vec<ConfigFactory> {
    let decoded = match decode_base64_lenient(content).and_then(|bytes| String::from_utf8(bytes).ok()) {
        Some(text) => text,
        None => {
            log::debug!("订阅内容不是 Base64，按纯文本处理");
            content.to_string()
        }
    };

    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match share_link::parse(line) {
            Ok(factory) => Some(factory),
            Err(e) => {
                log::warn!("跳过无法解析的订阅行：{}", e);
                None
            }
        })
        .collect()
}

// 解析订阅信息头（subscription-userinfo）。
// 示例：upload=0; download=123; total=1073741824; expire=1735689600
fn parse_subscription_info(headers: &reqwest::header::HeaderMap) -> Option<SubscriptionInfo> {
    let header_value = headers.get("subscription-userinfo")?.to_str().ok()?;

    log::debug!("解析订阅信息头：{}", header_value);

    let mut info = SubscriptionInfo::default();

    for pair in header_value.split(';') {
        if let Some((key, value)) = pair.trim().split_once('=') {
            let value = value.trim();
            match key.trim() {
                "upload" => info.upload = value.parse::<u64>().ok(),
                "download" => info.download = value.parse::<u64>().ok(),
                "total" => info.total = value.parse::<u64>().ok(),
                "expire" => info.expire = value.parse::<i64>().ok(),
                _ => {}
            }
        }
    }

    if info == SubscriptionInfo::default() {
        None
    } else {
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use reqwest::header::{HeaderMap, HeaderValue};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LINES: &str = "hysteria2://pw@a.example.com:443/?sni=a.example.com#X\n\
                         not-a-link\n\
                         hysteria2://pw@b.example.com:443/?sni=b.example.com#Y\n";

    // 单次响应的本地 HTTP 服务
    async fn serve_once(body: String, extra_headers: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
                body.len(),
                extra_headers,
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });

        format!("http://{}/sub", addr)
    }

    #[test]
    fn test_body_keeps_order_and_drops_bad_lines() {
        let body = STANDARD.encode(LINES);
        let factories = parse_subscription_body(&body);

        assert_eq!(factories.len(), 2);
        assert_eq!(factories[0].remark, "X");
        assert_eq!(factories[1].remark, "Y");
    }

    #[test]
    fn test_plain_text_body() {
        let factories = parse_subscription_body(LINES);
        assert_eq!(factories.len(), 2);
    }

    #[test]
    fn test_parse_subscription_info() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "subscription-userinfo",
            HeaderValue::from_static("upload=1; download=2; total=1073741824; expire=1735689600"),
        );

        let info = parse_subscription_info(&headers).unwrap();
        assert_eq!(info.upload, Some(1));
        assert_eq!(info.total, Some(1_073_741_824));
        assert_eq!(info.expire, Some(1_735_689_600));

        assert!(parse_subscription_info(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_in_flight_guard() {
        let in_flight = InFlight::default();

        let guard = in_flight.try_begin("s").unwrap();
        assert!(in_flight.try_begin("s").is_none());
        assert!(in_flight.try_begin("t").is_some());

        drop(guard);
        assert!(in_flight.try_begin("s").is_some());
    }

    #[tokio::test]
    async fn test_update_sends_parsed_factories() {
        let url = serve_once(
            STANDARD.encode(LINES),
            "subscription-userinfo: upload=0; download=5\r\n",
        )
        .await;

        let mut subscriptions = BTreeMap::new();
        subscriptions.insert(
            "s".to_string(),
            Subscription {
                remark: "sub".to_string(),
                web_url: url,
            },
        );

        let fetcher = SubscriptionFetcher::new().with_timeout(Duration::from_secs(5));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        assert_eq!(fetcher.update(&subscriptions, None, tx.clone()), vec!["s".to_string()]);
        // 前一次尚未完成，重复触发被忽略
        assert!(fetcher.update(&subscriptions, None, tx).is_empty());

        match rx.recv().await.unwrap() {
            SubscriptionEvent::Updated {
                subs_id,
                factories,
                info,
            } => {
                assert_eq!(subs_id, "s");
                assert_eq!(factories.len(), 2);
                assert_eq!(info.unwrap().download, Some(5));
            }
            SubscriptionEvent::Failed { error, .. } => panic!("unexpected failure: {}", error),
        }
    }

    #[tokio::test]
    async fn test_unreachable_subscription_fails() {
        // 绑定后立即释放，得到一个无人监听的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = download_subscription(
            &format!("http://{}/sub", addr),
            None,
            DEFAULT_USER_AGENT,
            Duration::from_secs(2),
        )
        .await;

        assert!(result.is_err());
    }
}
