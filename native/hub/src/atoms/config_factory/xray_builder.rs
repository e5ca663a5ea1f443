// Xray 类配置构建器
//
// 由分享链接参数生成完整的 Xray 配置（日志、两个本地入站、proxy/direct/block 出站、空路由），
// 并能从配置中反向提取同一组参数，供分享链接导出使用。

use serde_json::{Value, json};
use std::collections::BTreeMap;

// 已解码的分享链接参数（path/host/alpn/spx/key 已做 URL 解码）
pub type Kwargs = BTreeMap<String, String>;

pub const LOCAL_LISTEN: &str = "127.0.0.1";
pub const SOCKS_INBOUND_PORT: u16 = 10808;
pub const HTTP_INBOUND_PORT: u16 = 10809;
pub const PROXY_TAG: &str = "proxy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XrayProxy {
    Vmess {
        id: String,
        alter_id: u32,
        security: String,
    },
    Vless {
        id: String,
        encryption: String,
        flow: String,
    },
    Trojan {
        password: String,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
}

impl XrayProxy {
    pub fn protocol(&self) -> &'static str {
        match self {
            XrayProxy::Vmess { .. } => "vmess",
            XrayProxy::Vless { .. } => "vless",
            XrayProxy::Trojan { .. } => "trojan",
            XrayProxy::Shadowsocks { .. } => "shadowsocks",
        }
    }
}

// proxy 出站的完整描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrayOutbound {
    pub address: String,
    pub port: u16,
    pub proxy: XrayProxy,
    pub network: String,
    pub security: String,
    pub kwargs: Kwargs,
}

fn non_empty<'a>(kwargs: &'a Kwargs, key: &str) -> Option<&'a str> {
    kwargs.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

// 构建完整 Xray 配置
pub fn build_config(node: &XrayOutbound) -> Value {
    let sniffing = json!({
        "enabled": true,
        "destOverride": ["http", "tls"],
    });

    json!({
        "log": {
            "access": "",
            "error": "",
            "loglevel": "warning",
        },
        "inbounds": [
            {
                "tag": "socks",
                "port": SOCKS_INBOUND_PORT,
                "listen": LOCAL_LISTEN,
                "protocol": "socks",
                "sniffing": sniffing.clone(),
                "settings": {
                    "auth": "noauth",
                    "udp": true,
                },
            },
            {
                "tag": "http",
                "port": HTTP_INBOUND_PORT,
                "listen": LOCAL_LISTEN,
                "protocol": "http",
                "sniffing": sniffing,
                "settings": {
                    "allowTransparent": false,
                },
            },
        ],
        "outbounds": [
            build_outbound(node),
            {
                "tag": "direct",
                "protocol": "freedom",
                "settings": {},
            },
            {
                "tag": "block",
                "protocol": "blackhole",
                "settings": {
                    "response": {
                        "type": "http",
                    },
                },
            },
        ],
        "routing": {},
    })
}

// 构建 proxy 出站
pub fn build_outbound(node: &XrayOutbound) -> Value {
    let settings = match &node.proxy {
        XrayProxy::Vmess {
            id,
            alter_id,
            security,
        } => json!({
            "vnext": [{
                "address": node.address,
                "port": node.port,
                "users": [{
                    "id": id,
                    "alterId": alter_id,
                    "security": security,
                }],
            }],
        }),
        XrayProxy::Vless {
            id,
            encryption,
            flow,
        } => {
            let mut user = json!({
                "id": id,
                "encryption": encryption,
            });
            if !flow.is_empty() {
                user["flow"] = json!(flow);
            }
            json!({
                "vnext": [{
                    "address": node.address,
                    "port": node.port,
                    "users": [user],
                }],
            })
        }
        XrayProxy::Trojan { password } => json!({
            "servers": [{
                "address": node.address,
                "port": node.port,
                "password": password,
            }],
        }),
        XrayProxy::Shadowsocks { method, password } => json!({
            "servers": [{
                "address": node.address,
                "port": node.port,
                "method": method,
                "password": password,
            }],
        }),
    };

    json!({
        "tag": PROXY_TAG,
        "protocol": node.proxy.protocol(),
        "settings": settings,
        "streamSettings": build_stream_settings(&node.network, &node.security, &node.kwargs),
        "mux": {
            "enabled": false,
            "concurrency": -1,
        },
    })
}

// 按传输方式与安全层构建 streamSettings（参数为空时不写入对应字段）
pub fn build_stream_settings(network: &str, security: &str, kwargs: &Kwargs) -> Value {
    let mut stream = json!({
        "network": network,
        "security": security,
    });

    let header_type = non_empty(kwargs, "headerType").unwrap_or("none");

    match network {
        "tcp" => {
            stream["tcpSettings"] = json!({
                "header": { "type": header_type },
            });
        }
        "kcp" => {
            let mut kcp = json!({
                "header": { "type": header_type },
                "uplinkCapacity": 12,
                "downlinkCapacity": 100,
            });
            if let Some(seed) = non_empty(kwargs, "seed") {
                kcp["seed"] = json!(seed);
            }
            stream["kcpSettings"] = kcp;
        }
        "ws" => {
            let mut ws = json!({});
            if let Some(path) = non_empty(kwargs, "path") {
                ws["path"] = json!(path);
            }
            if let Some(host) = non_empty(kwargs, "host") {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        "h2" | "http" => {
            let mut http = json!({});
            if let Some(host) = non_empty(kwargs, "host") {
                http["host"] = json!(host.split(',').collect::<Vec<_>>());
            }
            if let Some(path) = non_empty(kwargs, "path") {
                http["path"] = json!(path);
            }
            stream["httpSettings"] = http;
        }
        "quic" => {
            let mut quic = json!({
                "header": { "type": header_type },
            });
            if let Some(quic_security) = non_empty(kwargs, "quicSecurity") {
                quic["security"] = json!(quic_security);
            }
            if let Some(key) = non_empty(kwargs, "key") {
                quic["key"] = json!(key);
            }
            stream["quicSettings"] = quic;
        }
        "grpc" => {
            let mut grpc = json!({
                "multiMode": kwargs.get("mode").map(String::as_str) == Some("multi"),
            });
            if let Some(service_name) = non_empty(kwargs, "serviceName") {
                grpc["serviceName"] = json!(service_name);
            }
            stream["grpcSettings"] = grpc;
        }
        _ => {}
    }

    match security {
        "tls" => {
            stream["tlsSettings"] = build_tls_fields(kwargs);
        }
        "reality" => {
            let mut reality = build_tls_fields(kwargs);
            if let Some(pbk) = non_empty(kwargs, "pbk") {
                reality["publicKey"] = json!(pbk);
            }
            if let Some(sid) = non_empty(kwargs, "sid") {
                reality["shortId"] = json!(sid);
            }
            if let Some(spx) = non_empty(kwargs, "spx") {
                reality["spiderX"] = json!(spx);
            }
            stream["realitySettings"] = reality;
        }
        // none 及未知安全层写入空的 tlsSettings
        _ => {
            stream["tlsSettings"] = json!({});
        }
    }

    stream
}

fn build_tls_fields(kwargs: &Kwargs) -> Value {
    let mut tls = json!({});
    if let Some(fp) = non_empty(kwargs, "fp") {
        tls["fingerprint"] = json!(fp);
    }
    if let Some(sni) = non_empty(kwargs, "sni") {
        tls["serverName"] = json!(sni);
    }
    if let Some(alpn) = non_empty(kwargs, "alpn") {
        tls["alpn"] = json!(alpn.split(',').collect::<Vec<_>>());
    }
    tls
}

// 查找 tag 为 proxy 的出站
pub fn proxy_outbound(config: &Value) -> Option<&Value> {
    config
        .get("outbounds")?
        .as_array()?
        .iter()
        .find(|o| o.get("tag").and_then(Value::as_str) == Some(PROXY_TAG))
}

// 出站的目标服务器条目（vnext[0] 或 servers[0]）
pub fn outbound_server(outbound: &Value) -> Option<&Value> {
    let settings = outbound.get("settings")?;
    settings
        .get("vnext")
        .or_else(|| settings.get("servers"))?
        .as_array()?
        .first()
}

// 兼容数字与字符串两种写法
pub fn value_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn put(kwargs: &mut Kwargs, key: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        kwargs.insert(key.to_string(), v.to_string());
    }
}

fn join_strings(value: Option<&Value>) -> Option<String> {
    let items: Vec<&str> = value?.as_array()?.iter().filter_map(Value::as_str).collect();
    if items.is_empty() {
        None
    } else {
        Some(items.join(","))
    }
}

// 从 streamSettings 反向提取传输参数
pub fn extract_stream(stream: Option<&Value>) -> (String, String, Kwargs) {
    let empty = json!({});
    let stream = stream.unwrap_or(&empty);

    let network = str_at(stream, "/network").unwrap_or("tcp").to_string();
    let security = str_at(stream, "/security").unwrap_or("none").to_string();
    let mut kwargs = Kwargs::new();

    match network.as_str() {
        "tcp" => {
            put(&mut kwargs, "headerType", str_at(stream, "/tcpSettings/header/type"));
        }
        "kcp" => {
            put(&mut kwargs, "headerType", str_at(stream, "/kcpSettings/header/type"));
            put(&mut kwargs, "seed", str_at(stream, "/kcpSettings/seed"));
        }
        "ws" => {
            put(&mut kwargs, "path", str_at(stream, "/wsSettings/path"));
            put(&mut kwargs, "host", str_at(stream, "/wsSettings/headers/Host"));
        }
        "h2" | "http" => {
            let host = join_strings(stream.pointer("/httpSettings/host"));
            put(&mut kwargs, "host", host.as_deref());
            put(&mut kwargs, "path", str_at(stream, "/httpSettings/path"));
        }
        "quic" => {
            put(&mut kwargs, "quicSecurity", str_at(stream, "/quicSettings/security"));
            put(&mut kwargs, "key", str_at(stream, "/quicSettings/key"));
            put(&mut kwargs, "headerType", str_at(stream, "/quicSettings/header/type"));
        }
        "grpc" => {
            put(&mut kwargs, "serviceName", str_at(stream, "/grpcSettings/serviceName"));
            let multi = stream
                .pointer("/grpcSettings/multiMode")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if multi {
                put(&mut kwargs, "mode", Some("multi"));
            }
        }
        _ => {}
    }

    let tls_key = match security.as_str() {
        "tls" => Some("tlsSettings"),
        "reality" => Some("realitySettings"),
        _ => None,
    };

    if let Some(tls_key) = tls_key
        && let Some(tls) = stream.get(tls_key)
    {
        put(&mut kwargs, "fp", str_at(tls, "/fingerprint"));
        put(&mut kwargs, "sni", str_at(tls, "/serverName"));
        let alpn = join_strings(tls.get("alpn"));
        put(&mut kwargs, "alpn", alpn.as_deref());

        if security == "reality" {
            put(&mut kwargs, "pbk", str_at(tls, "/publicKey"));
            put(&mut kwargs, "sid", str_at(tls, "/shortId"));
            put(&mut kwargs, "spx", str_at(tls, "/spiderX"));
        }
    }

    (network, security, kwargs)
}

// 从完整配置反向提取 proxy 出站描述
pub fn extract_outbound(config: &Value) -> Option<XrayOutbound> {
    let outbound = proxy_outbound(config)?;
    let server = outbound_server(outbound)?;

    let address = server.get("address")?.as_str()?.to_string();
    let port = value_to_string(server.get("port")).parse::<u16>().ok()?;

    let proxy = match outbound.get("protocol")?.as_str()? {
        "vmess" => {
            let user = server.pointer("/users/0")?;
            XrayProxy::Vmess {
                id: value_to_string(user.get("id")),
                alter_id: value_to_string(user.get("alterId")).parse().unwrap_or(0),
                security: str_at(user, "/security").unwrap_or("auto").to_string(),
            }
        }
        "vless" => {
            let user = server.pointer("/users/0")?;
            XrayProxy::Vless {
                id: value_to_string(user.get("id")),
                encryption: str_at(user, "/encryption").unwrap_or("none").to_string(),
                flow: str_at(user, "/flow").unwrap_or("").to_string(),
            }
        }
        "trojan" => XrayProxy::Trojan {
            password: value_to_string(server.get("password")),
        },
        "shadowsocks" => XrayProxy::Shadowsocks {
            method: value_to_string(server.get("method")),
            password: value_to_string(server.get("password")),
        },
        _ => return None,
    };

    let (network, security, kwargs) = extract_stream(outbound.get("streamSettings"));

    Some(XrayOutbound {
        address,
        port,
        proxy,
        network,
        security,
        kwargs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(pairs: &[(&str, &str)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn vless_outbound(network: &str, security: &str, pairs: &[(&str, &str)]) -> XrayOutbound {
        XrayOutbound {
            address: "example.com".to_string(),
            port: 443,
            proxy: XrayProxy::Vless {
                id: "id".to_string(),
                encryption: "none".to_string(),
                flow: String::new(),
            },
            network: network.to_string(),
            security: security.to_string(),
            kwargs: kwargs(pairs),
        }
    }

    #[test]
    fn test_full_config_layout() {
        let config = build_config(&vless_outbound("tcp", "none", &[]));

        assert_eq!(config["inbounds"][0]["port"], 10808);
        assert_eq!(config["inbounds"][1]["protocol"], "http");
        assert_eq!(config["inbounds"][1]["listen"], "127.0.0.1");
        assert_eq!(config["inbounds"][0]["sniffing"]["enabled"], true);
        assert_eq!(config["outbounds"][0]["tag"], "proxy");
        assert_eq!(config["outbounds"][1]["protocol"], "freedom");
        assert_eq!(config["outbounds"][2]["settings"]["response"]["type"], "http");
        assert_eq!(config["routing"], json!({}));
        assert_eq!(
            config["outbounds"][0]["streamSettings"]["tcpSettings"]["header"]["type"],
            "none"
        );
        assert_eq!(config["outbounds"][0]["streamSettings"]["security"], "none");
        assert_eq!(config["outbounds"][0]["streamSettings"]["tlsSettings"], json!({}));
        assert!(
            config["outbounds"][0]["streamSettings"]
                .get("realitySettings")
                .is_none()
        );
    }

    #[test]
    fn test_kcp_defaults_and_seed() {
        let stream = build_stream_settings("kcp", "none", &kwargs(&[("seed", "s3cret")]));

        assert_eq!(stream["kcpSettings"]["uplinkCapacity"], 12);
        assert_eq!(stream["kcpSettings"]["downlinkCapacity"], 100);
        assert_eq!(stream["kcpSettings"]["seed"], "s3cret");
        assert_eq!(stream["kcpSettings"]["header"]["type"], "none");
    }

    #[test]
    fn test_h2_host_is_split() {
        let stream = build_stream_settings(
            "h2",
            "tls",
            &kwargs(&[("host", "a.com,b.com"), ("path", "/h2"), ("alpn", "h2,http/1.1")]),
        );

        assert_eq!(stream["httpSettings"]["host"], json!(["a.com", "b.com"]));
        assert_eq!(stream["httpSettings"]["path"], "/h2");
        assert_eq!(stream["tlsSettings"]["alpn"], json!(["h2", "http/1.1"]));
    }

    #[test]
    fn test_grpc_multi_mode() {
        let multi = build_stream_settings("grpc", "none", &kwargs(&[("mode", "multi")]));
        let gun = build_stream_settings("grpc", "none", &kwargs(&[("serviceName", "svc")]));

        assert_eq!(multi["grpcSettings"]["multiMode"], true);
        assert_eq!(gun["grpcSettings"]["multiMode"], false);
        assert_eq!(gun["grpcSettings"]["serviceName"], "svc");
    }

    #[test]
    fn test_reality_fields() {
        let stream = build_stream_settings(
            "tcp",
            "reality",
            &kwargs(&[("pbk", "PUB"), ("sid", "ab"), ("spx", "/"), ("sni", "x.com"), ("fp", "chrome")]),
        );

        let reality = &stream["realitySettings"];
        assert_eq!(reality["publicKey"], "PUB");
        assert_eq!(reality["shortId"], "ab");
        assert_eq!(reality["spiderX"], "/");
        assert_eq!(reality["serverName"], "x.com");
        assert_eq!(reality["fingerprint"], "chrome");
    }

    #[test]
    fn test_extract_inverts_build() {
        let node = vless_outbound(
            "ws",
            "tls",
            &[("path", "/ws"), ("host", "cdn.example.com"), ("sni", "example.com")],
        );
        let config = build_config(&node);

        let extracted = extract_outbound(&config).unwrap();
        assert_eq!(build_config(&extracted), config);
    }
}
