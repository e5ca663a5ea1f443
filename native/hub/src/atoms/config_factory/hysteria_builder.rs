// Hysteria 配置构建器（v1 / v2）
//
// 两代核心的 JSON 结构差异较大：v1 为扁平字段，v2 将 TLS 与混淆拆成嵌套对象。

use serde_json::{Value, json};

use super::xray_builder::{HTTP_INBOUND_PORT, LOCAL_LISTEN, SOCKS_INBOUND_PORT, value_to_string};

pub const DEFAULT_UP_MBPS: u64 = 10;
pub const DEFAULT_DOWN_MBPS: u64 = 50;

// Hysteria1 参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hysteria1Server {
    // host:port
    pub server: String,
    pub protocol: String,
    pub auth: String,
    pub peer: String,
    pub insecure: bool,
    pub up_mbps: u64,
    pub down_mbps: u64,
    pub alpn: String,
    pub obfs: String,
}

// Hysteria2 参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hysteria2Server {
    // host:port
    pub server: String,
    pub auth: String,
    pub sni: String,
    pub insecure: bool,
    pub obfs: String,
    pub obfs_password: String,
    pub pin_sha256: String,
}

fn local_endpoints() -> (String, String) {
    (
        format!("{}:{}", LOCAL_LISTEN, SOCKS_INBOUND_PORT),
        format!("{}:{}", LOCAL_LISTEN, HTTP_INBOUND_PORT),
    )
}

pub fn build_hysteria1(node: &Hysteria1Server) -> Value {
    let (socks, http) = local_endpoints();

    let mut config = json!({
        "server": node.server,
        "up_mbps": node.up_mbps,
        "down_mbps": node.down_mbps,
        "socks5": { "listen": socks },
        "http": { "listen": http },
        "insecure": node.insecure,
        "retry": 3,
        "retry_interval": 5,
    });

    if !node.protocol.is_empty() {
        config["protocol"] = json!(node.protocol);
    }
    if !node.auth.is_empty() {
        config["auth_str"] = json!(node.auth);
    }
    if !node.peer.is_empty() {
        config["server_name"] = json!(node.peer);
    }
    if !node.alpn.is_empty() {
        config["alpn"] = json!(node.alpn);
    }
    if !node.obfs.is_empty() {
        config["obfs"] = json!(node.obfs);
    }

    config
}

pub fn build_hysteria2(node: &Hysteria2Server) -> Value {
    let (socks, http) = local_endpoints();

    let mut tls = json!({ "insecure": node.insecure });
    if !node.sni.is_empty() {
        tls["sni"] = json!(node.sni);
    }
    if !node.pin_sha256.is_empty() {
        tls["pinSHA256"] = json!(node.pin_sha256);
    }

    let mut config = json!({
        "server": node.server,
        "tls": tls,
        "socks5": { "listen": socks },
        "http": { "listen": http },
    });

    if !node.auth.is_empty() {
        config["auth"] = json!(node.auth);
    }

    if !node.obfs.is_empty() {
        let mut obfs = json!({ "type": node.obfs });
        if !node.obfs_password.is_empty() {
            obfs[node.obfs.as_str()] = json!({ "password": node.obfs_password });
        }
        config["obfs"] = obfs;
    }

    config
}

fn as_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "true"),
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    }
}

fn as_string(value: Option<&Value>) -> String {
    value_to_string(value)
}

pub fn extract_hysteria1(config: &Value) -> Option<Hysteria1Server> {
    let server = config.get("server")?.as_str()?.to_string();

    Some(Hysteria1Server {
        server,
        protocol: as_string(config.get("protocol")),
        auth: as_string(config.get("auth_str")),
        peer: as_string(config.get("server_name")),
        insecure: as_bool(config.get("insecure")),
        up_mbps: as_string(config.get("up_mbps"))
            .parse()
            .unwrap_or(DEFAULT_UP_MBPS),
        down_mbps: as_string(config.get("down_mbps"))
            .parse()
            .unwrap_or(DEFAULT_DOWN_MBPS),
        alpn: as_string(config.get("alpn")),
        obfs: as_string(config.get("obfs")),
    })
}

pub fn extract_hysteria2(config: &Value) -> Option<Hysteria2Server> {
    let server = config.get("server")?.as_str()?.to_string();
    let tls = config.get("tls");

    let obfs = config
        .pointer("/obfs/type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let obfs_password = if obfs.is_empty() {
        String::new()
    } else {
        as_string(config.pointer(&format!("/obfs/{}/password", obfs)))
    };

    Some(Hysteria2Server {
        server,
        auth: as_string(config.get("auth")),
        sni: as_string(tls.and_then(|t| t.get("sni"))),
        insecure: as_bool(tls.and_then(|t| t.get("insecure"))),
        obfs,
        obfs_password,
        pin_sha256: as_string(tls.and_then(|t| t.get("pinSHA256"))),
    })
}
