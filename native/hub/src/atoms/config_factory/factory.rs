// 配置工厂：一条服务器配置的完整表示
//
// JSON 主体为权威数据；remark / subs_id 为持久化附加字段；
// delay_result / speed_result 为测试瞬态结果，仅用于展示。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::xray_builder::{self, LOCAL_LISTEN};

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

// 进程内唯一的工厂句柄，跨越列表重排保持稳定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactoryId(u64);

impl FactoryId {
    fn next() -> Self {
        Self(NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

// 删除标记的只读视图，交给后台测试任务
#[derive(Debug, Clone)]
pub struct DeletionToken(Arc<AtomicBool>);

impl DeletionToken {
    pub fn is_deleted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKind {
    Xray,
    Hysteria1,
    Hysteria2,
}

impl ConfigKind {
    // 仅 Hysteria1 使用的字段
    const HYSTERIA1_KEYS: [&'static str; 4] = ["protocol", "up_mbps", "down_mbps", "auth_str"];

    // 按 JSON 结构推断配置类型
    pub fn detect(json: &Value) -> Option<Self> {
        let object = json.as_object()?;

        if object.contains_key("inbounds") || object.contains_key("outbounds") {
            return Some(ConfigKind::Xray);
        }

        if !object.contains_key("server") {
            return None;
        }

        let hysteria1 = Self::HYSTERIA1_KEYS.iter().any(|k| object.contains_key(*k))
            || object.get("obfs").is_some_and(Value::is_string);

        if hysteria1 {
            Some(ConfigKind::Hysteria1)
        } else {
            Some(ConfigKind::Hysteria2)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKind::Xray => "Xray",
            ConfigKind::Hysteria1 => "Hysteria1",
            ConfigKind::Hysteria2 => "Hysteria2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Xray" => Some(ConfigKind::Xray),
            "Hysteria1" => Some(ConfigKind::Hysteria1),
            "Hysteria2" => Some(ConfigKind::Hysteria2),
            _ => None,
        }
    }
}

// 配置主体：已解析的 JSON，或用户输入的原始文本（含空占位）
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigBody {
    Json(Value),
    Text(String),
}

impl ConfigBody {
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(value) if value.is_object() => ConfigBody::Json(value),
            _ => ConfigBody::Text(text.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct ConfigFactory {
    id: FactoryId,
    kind: ConfigKind,
    body: ConfigBody,
    pub remark: String,
    pub subs_id: String,
    pub delay_result: String,
    pub speed_result: String,
    deleted: Arc<AtomicBool>,
}

impl ConfigFactory {
    pub fn new(kind: ConfigKind, body: ConfigBody) -> Self {
        Self {
            id: FactoryId::next(),
            kind,
            body,
            remark: String::new(),
            subs_id: String::new(),
            delay_result: String::new(),
            speed_result: String::new(),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_json(kind: ConfigKind, json: Value) -> Self {
        Self::new(kind, ConfigBody::Json(json))
    }

    pub fn from_text(kind: ConfigKind, text: &str) -> Self {
        Self::new(kind, ConfigBody::from_text(text))
    }

    pub fn with_remark(mut self, remark: &str) -> Self {
        self.remark = remark.to_string();
        self
    }

    // 从粘贴或文件读取的 JSON 文本导入，类型由结构推断
    pub fn from_json_text(text: &str) -> Result<Self, String> {
        let json: Value =
            serde_json::from_str(text.trim()).map_err(|e| format!("JSON 解析失败：{}", e))?;

        let kind =
            ConfigKind::detect(&json).ok_or_else(|| "无法识别的配置类型".to_string())?;

        Ok(Self::from_json(kind, json))
    }

    // 从 JSON 文件导入，文件名作为备注
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("读取配置文件 {} 失败：{}", path.display(), e))?;

        let remark = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self::from_json_text(&content)?.with_remark(&remark))
    }

    pub fn id(&self) -> FactoryId {
        self.id
    }

    pub fn kind(&self) -> ConfigKind {
        self.kind
    }

    pub fn body(&self) -> &ConfigBody {
        &self.body
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ConfigBody::Json(value) => Some(value),
            ConfigBody::Text(_) => None,
        }
    }

    pub fn json_mut(&mut self) -> Option<&mut Value> {
        match &mut self.body {
            ConfigBody::Json(value) => Some(value),
            ConfigBody::Text(_) => None,
        }
    }

    // 以用户编辑的文本替换主体
    pub fn set_body_text(&mut self, text: &str) {
        self.body = ConfigBody::from_text(text);
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn deletion_token(&self) -> DeletionToken {
        DeletionToken(Arc::clone(&self.deleted))
    }

    // 独立副本：新的句柄与删除标记
    pub fn deep_copy(&self) -> Self {
        Self {
            id: FactoryId::next(),
            kind: self.kind,
            body: self.body.clone(),
            remark: self.remark.clone(),
            subs_id: self.subs_id.clone(),
            delay_result: self.delay_result.clone(),
            speed_result: self.speed_result.clone(),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    // 忽略测试结果与句柄的比较
    pub fn equals_ignoring_transient(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.body == other.body
            && self.remark == other.remark
            && self.subs_id == other.subs_id
    }

    pub fn to_json_string(&self) -> String {
        match &self.body {
            ConfigBody::Json(value) => serde_json::to_string_pretty(value).unwrap_or_default(),
            ConfigBody::Text(text) => text.clone(),
        }
    }

    pub fn to_json_dict(&self) -> Result<Value, String> {
        match &self.body {
            ConfigBody::Json(value) => Ok(value.clone()),
            ConfigBody::Text(text) => {
                serde_json::from_str(text).map_err(|e| format!("JSON 解析失败：{}", e))
            }
        }
    }

    // JSON 有效且至少包含一个可识别的代理出站或服务器
    pub fn is_valid(&self) -> bool {
        let Some(json) = self.json() else {
            return false;
        };

        match self.kind {
            ConfigKind::Xray => xray_builder::proxy_outbound(json).is_some(),
            ConfigKind::Hysteria1 | ConfigKind::Hysteria2 => json
                .get("server")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty()),
        }
    }

    pub fn to_uri(&self) -> Result<String, crate::atoms::share_link::ShareLinkError> {
        crate::atoms::share_link::emit(self)
    }

    pub fn item_remark(&self) -> &str {
        &self.remark
    }

    pub fn item_protocol(&self) -> String {
        match self.kind {
            ConfigKind::Xray => {
                let protocol = self
                    .json()
                    .and_then(xray_builder::proxy_outbound)
                    .and_then(|o| o.get("protocol"))
                    .and_then(Value::as_str)
                    .unwrap_or("");

                match protocol {
                    "vmess" => "VMess".to_string(),
                    "vless" => "VLESS".to_string(),
                    "trojan" => "Trojan".to_string(),
                    "shadowsocks" => "Shadowsocks".to_string(),
                    other => other.to_string(),
                }
            }
            kind => kind.as_str().to_string(),
        }
    }

    pub fn item_address(&self) -> String {
        let Some(json) = self.json() else {
            return String::new();
        };

        match self.kind {
            ConfigKind::Xray => xray_builder::proxy_outbound(json)
                .and_then(xray_builder::outbound_server)
                .map(|s| xray_builder::value_to_string(s.get("address")))
                .unwrap_or_default(),
            _ => hysteria_server(json).0,
        }
    }

    pub fn item_port(&self) -> String {
        let Some(json) = self.json() else {
            return String::new();
        };

        match self.kind {
            ConfigKind::Xray => xray_builder::proxy_outbound(json)
                .and_then(xray_builder::outbound_server)
                .map(|s| xray_builder::value_to_string(s.get("port")))
                .unwrap_or_default(),
            _ => hysteria_server(json).1,
        }
    }

    pub fn item_transport(&self) -> String {
        let Some(json) = self.json() else {
            return String::new();
        };

        match self.kind {
            ConfigKind::Xray => xray_builder::proxy_outbound(json)
                .and_then(|o| o.pointer("/streamSettings/network"))
                .and_then(Value::as_str)
                .unwrap_or("tcp")
                .to_string(),
            ConfigKind::Hysteria1 => json
                .get("protocol")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .unwrap_or("udp")
                .to_string(),
            ConfigKind::Hysteria2 => "udp".to_string(),
        }
    }

    pub fn item_tls(&self) -> String {
        let Some(json) = self.json() else {
            return String::new();
        };

        match self.kind {
            ConfigKind::Xray => xray_builder::proxy_outbound(json)
                .and_then(|o| o.pointer("/streamSettings/security"))
                .and_then(Value::as_str)
                .unwrap_or("none")
                .to_string(),
            _ => "tls".to_string(),
        }
    }

    // 本地 HTTP 入站地址（host:port），缺失或格式错误时返回 None
    pub fn http_proxy_endpoint(&self) -> Option<String> {
        self.inbound_endpoint("http", "http")
    }

    // 本地 SOCKS 入站地址，VPN 模式下 tun2socks 转发到这里
    pub fn socks_proxy_endpoint(&self) -> Option<String> {
        self.inbound_endpoint("socks", "socks5")
    }

    fn inbound_endpoint(&self, protocol: &str, hysteria_key: &str) -> Option<String> {
        let json = self.json()?;

        let (host, port) = match self.kind {
            ConfigKind::Xray => {
                let inbound = json.get("inbounds")?.as_array()?.iter().find(|i| {
                    i.get("protocol").and_then(Value::as_str) == Some(protocol)
                })?;
                let host = inbound
                    .get("listen")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let port = xray_builder::value_to_string(inbound.get("port"));
                (host, port)
            }
            ConfigKind::Hysteria1 | ConfigKind::Hysteria2 => {
                let listen = match json.get(hysteria_key)? {
                    Value::String(s) => s.as_str(),
                    Value::Object(map) => map.get("listen")?.as_str()?,
                    _ => return None,
                };
                let (host, port) = listen.rsplit_once(':')?;
                (host.to_string(), port.to_string())
            }
        };

        let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = match host {
            "" | "0.0.0.0" | "::" => LOCAL_LISTEN,
            other => other,
        };

        Some(format!("{}:{}", host, port))
    }
}

// 拆分 Hysteria 的 server 字段（支持 [IPv6]:port 与端口范围）
fn hysteria_server(json: &Value) -> (String, String) {
    let server = json.get("server").and_then(Value::as_str).unwrap_or("");

    match server.rsplit_once(':') {
        Some((host, port)) => (
            host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port.to_string(),
        ),
        None => (server.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn xray_factory() -> ConfigFactory {
        ConfigFactory::from_json(
            ConfigKind::Xray,
            json!({
                "inbounds": [
                    { "protocol": "socks", "listen": "127.0.0.1", "port": 10808 },
                    { "protocol": "http", "listen": "127.0.0.1", "port": 10809 },
                ],
                "outbounds": [{
                    "tag": "proxy",
                    "protocol": "trojan",
                    "settings": { "servers": [{ "address": "t.example.com", "port": 443, "password": "p" }] },
                    "streamSettings": { "network": "ws", "security": "tls" },
                }],
            }),
        )
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(
            ConfigKind::detect(&json!({ "outbounds": [] })),
            Some(ConfigKind::Xray)
        );
        assert_eq!(
            ConfigKind::detect(&json!({ "server": "a:1", "up_mbps": 10 })),
            Some(ConfigKind::Hysteria1)
        );
        assert_eq!(
            ConfigKind::detect(&json!({ "server": "a:1", "obfs": "xplus" })),
            Some(ConfigKind::Hysteria1)
        );
        assert_eq!(
            ConfigKind::detect(&json!({ "server": "a:1", "tls": {} })),
            Some(ConfigKind::Hysteria2)
        );
        assert_eq!(ConfigKind::detect(&json!({ "foo": 1 })), None);
        assert_eq!(ConfigKind::detect(&json!([1, 2])), None);
    }

    #[test]
    fn test_xray_accessors() {
        let factory = xray_factory();

        assert!(factory.is_valid());
        assert_eq!(factory.item_protocol(), "Trojan");
        assert_eq!(factory.item_address(), "t.example.com");
        assert_eq!(factory.item_port(), "443");
        assert_eq!(factory.item_transport(), "ws");
        assert_eq!(factory.item_tls(), "tls");
        assert_eq!(
            factory.http_proxy_endpoint().as_deref(),
            Some("127.0.0.1:10809")
        );
        assert_eq!(
            factory.socks_proxy_endpoint().as_deref(),
            Some("127.0.0.1:10808")
        );
    }

    #[test]
    fn test_hysteria_endpoint_forms() {
        let v1 = ConfigFactory::from_json(
            ConfigKind::Hysteria1,
            json!({ "server": "[2001:db8::1]:443", "http": { "listen": ":8080" } }),
        );
        let v2 = ConfigFactory::from_json(
            ConfigKind::Hysteria2,
            json!({ "server": "h.example.com:443", "http": "127.0.0.1:9000" }),
        );

        assert_eq!(v1.http_proxy_endpoint().as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(v1.item_address(), "2001:db8::1");
        assert_eq!(v2.http_proxy_endpoint().as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(v2.item_port(), "443");
        assert_eq!(v2.socks_proxy_endpoint(), None);
    }

    #[test]
    fn test_missing_or_malformed_endpoint() {
        let no_http = ConfigFactory::from_json(
            ConfigKind::Xray,
            json!({ "inbounds": [{ "protocol": "socks", "port": 1080 }] }),
        );
        let bad_port = ConfigFactory::from_json(
            ConfigKind::Hysteria2,
            json!({ "server": "h:1", "http": { "listen": "127.0.0.1:http" } }),
        );

        assert_eq!(no_http.http_proxy_endpoint(), None);
        assert_eq!(bad_port.http_proxy_endpoint(), None);
    }

    #[test]
    fn test_placeholder_is_invalid() {
        let factory = ConfigFactory::from_text(ConfigKind::Xray, "");

        assert!(!factory.is_valid());
        assert_eq!(factory.to_json_string(), "");
        assert!(factory.to_json_dict().is_err());
        assert_eq!(factory.http_proxy_endpoint(), None);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let mut original = xray_factory().with_remark("a");
        let copy = original.deep_copy();

        original.mark_deleted();
        original.remark = "b".to_string();

        assert_ne!(copy.id(), original.id());
        assert!(!copy.is_deleted());
        assert_eq!(copy.remark, "a");
    }

    #[test]
    fn test_json_string_round_trip() {
        let factory = xray_factory();
        let reparsed = ConfigFactory::from_text(ConfigKind::Xray, &factory.to_json_string());

        assert_eq!(reparsed.to_json_dict(), factory.to_json_dict());
    }

    #[test]
    fn test_deletion_token_observes_flag() {
        let factory = xray_factory();
        let token = factory.deletion_token();

        assert!(!token.is_deleted());
        factory.mark_deleted();
        assert!(token.is_deleted());
    }

    #[test]
    fn test_from_json_text_rejects_unknown() {
        assert!(ConfigFactory::from_json_text("{\"a\": 1}").is_err());
        assert!(ConfigFactory::from_json_text("not json").is_err());
        assert_eq!(
            ConfigFactory::from_json_text("{\"server\": \"x:1\"}")
                .unwrap()
                .kind(),
            ConfigKind::Hysteria2
        );
    }
}
