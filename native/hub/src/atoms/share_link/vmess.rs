// VMess 链接
//
// 优先按 v2rayN 分享标准（Base64 包裹的 JSON）解析；
// 解码结果不是 JSON 时，仅回退一次到标准 URI 形式。

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use super::codec::{ShareLinkError, decode_base64_lenient};
use super::standard;
use crate::atoms::config_factory::xray_builder::{Kwargs, XrayOutbound, XrayProxy, value_to_string};
use crate::atoms::config_factory::ConfigFactory;

pub(super) fn parse(rest: &str) -> Result<ConfigFactory, ShareLinkError> {
    let decoded = decode_base64_lenient(rest).and_then(|bytes| String::from_utf8(bytes).ok());

    let Some(decoded) = decoded else {
        return standard::parse_xray("vmess", &format!("vmess://{}", rest));
    };

    match serde_json::from_str::<Value>(&decoded) {
        Ok(Value::Object(fields)) => parse_v2rayn(&fields),
        _ => {
            // 解码结果为 URI 风格文本
            let link = if decoded.contains("://") {
                decoded
            } else {
                format!("vmess://{}", decoded)
            };
            standard::parse_xray("vmess", &link)
        }
    }
}

fn field(fields: &Map<String, Value>, key: &str) -> String {
    value_to_string(fields.get(key))
}

fn put(kwargs: &mut Kwargs, key: &str, value: String) {
    if !value.is_empty() {
        kwargs.insert(key.to_string(), value);
    }
}

fn parse_v2rayn(fields: &Map<String, Value>) -> Result<ConfigFactory, ShareLinkError> {
    let address = field(fields, "add");
    if address.is_empty() {
        return Err(ShareLinkError::malformed("缺少服务器地址"));
    }

    let port_text = field(fields, "port");
    let port = port_text
        .parse::<u16>()
        .map_err(|_| ShareLinkError::malformed(format!("端口解析失败：{}", port_text)))?;

    let network = match field(fields, "net") {
        n if n.is_empty() => "tcp".to_string(),
        n => n,
    };
    let security = match field(fields, "tls") {
        s if s.is_empty() => "none".to_string(),
        s => s,
    };

    let header_type = field(fields, "type");
    let host = field(fields, "host");
    let path = field(fields, "path");

    // v2rayN 复用 type/host/path 三个字段承载不同传输方式的参数
    let mut kwargs = Kwargs::new();
    match network.as_str() {
        "kcp" => {
            put(&mut kwargs, "headerType", header_type);
            put(&mut kwargs, "seed", path);
        }
        "quic" => {
            put(&mut kwargs, "headerType", header_type);
            put(&mut kwargs, "quicSecurity", host);
            put(&mut kwargs, "key", path);
        }
        "grpc" => {
            put(&mut kwargs, "mode", header_type);
            put(&mut kwargs, "serviceName", path);
        }
        "ws" | "h2" | "http" => {
            put(&mut kwargs, "host", host);
            put(&mut kwargs, "path", path);
        }
        _ => {
            put(&mut kwargs, "headerType", header_type);
        }
    }

    for key in ["sni", "alpn", "fp", "pbk", "sid", "spx"] {
        put(&mut kwargs, key, field(fields, key));
    }

    let security_field = field(fields, "scy");
    let node = XrayOutbound {
        address,
        port,
        proxy: XrayProxy::Vmess {
            id: field(fields, "id"),
            alter_id: field(fields, "aid").parse().unwrap_or(0),
            security: if security_field.is_empty() {
                "auto".to_string()
            } else {
                security_field
            },
        },
        network,
        security,
        kwargs,
    };

    Ok(standard::factory_from_outbound(&node, &field(fields, "ps")))
}

pub(super) fn emit(node: &XrayOutbound, remark: &str) -> Result<String, ShareLinkError> {
    let XrayProxy::Vmess {
        id,
        alter_id,
        security,
    } = &node.proxy
    else {
        return Err(ShareLinkError::InvalidScheme(node.proxy.protocol().to_string()));
    };

    let kw = |key: &str| node.kwargs.get(key).cloned().unwrap_or_default();

    let (header_type, host, path) = match node.network.as_str() {
        "kcp" => (kw("headerType"), String::new(), kw("seed")),
        "quic" => (kw("headerType"), kw("quicSecurity"), kw("key")),
        "grpc" => (kw("mode"), String::new(), kw("serviceName")),
        "ws" | "h2" | "http" => (String::new(), kw("host"), kw("path")),
        _ => (kw("headerType"), String::new(), String::new()),
    };

    let tls = if node.security == "none" {
        String::new()
    } else {
        node.security.clone()
    };

    let mut share = json!({
        "v": "2",
        "ps": remark,
        "add": node.address,
        "port": node.port.to_string(),
        "id": id,
        "aid": alter_id.to_string(),
        "scy": security,
        "net": node.network,
        "type": header_type,
        "host": host,
        "path": path,
        "tls": tls,
        "sni": kw("sni"),
        "alpn": kw("alpn"),
        "fp": kw("fp"),
    });

    if node.security == "reality" {
        share["pbk"] = json!(kw("pbk"));
        share["sid"] = json!(kw("sid"));
        share["spx"] = json!(kw("spx"));
    }

    let text = serde_json::to_string(&share)
        .map_err(|e| ShareLinkError::malformed(format!("序列化失败：{}", e)))?;

    Ok(format!("vmess://{}", BASE64.encode(text.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::share_link::parse as parse_link;

    fn encode(value: &Value) -> String {
        format!("vmess://{}", BASE64.encode(value.to_string().as_bytes()))
    }

    #[test]
    fn test_v2rayn_ws_fields() {
        let link = encode(&json!({
            "v": "2", "ps": "ws node", "add": "ws.example.com", "port": 443,
            "id": "uuid", "aid": "0", "net": "ws", "host": "cdn.example.com",
            "path": "/ray", "tls": "tls", "sni": "ws.example.com",
        }));

        let factory = parse_link(&link).unwrap();
        let stream = &factory.json().unwrap()["outbounds"][0]["streamSettings"];

        assert_eq!(stream["wsSettings"]["path"], "/ray");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example.com");
        assert_eq!(stream["tlsSettings"]["serverName"], "ws.example.com");
        assert_eq!(
            factory.json().unwrap()["outbounds"][0]["settings"]["vnext"][0]["users"][0]["security"],
            "auto"
        );
    }

    #[test]
    fn test_v2rayn_grpc_uses_path_and_type() {
        let link = encode(&json!({
            "v": "2", "ps": "g", "add": "g.example.com", "port": "443",
            "id": "uuid", "net": "grpc", "type": "multi", "path": "svc", "tls": "tls",
        }));

        let factory = parse_link(&link).unwrap();
        let grpc = &factory.json().unwrap()["outbounds"][0]["streamSettings"]["grpcSettings"];

        assert_eq!(grpc["serviceName"], "svc");
        assert_eq!(grpc["multiMode"], true);

        let reparsed = parse_link(&factory.to_uri().unwrap()).unwrap();
        assert!(factory.equals_ignoring_transient(&reparsed));
    }

    #[test]
    fn test_base64_wrapped_standard_uri() {
        let inner = "uuid@std.example.com:443?type=tcp&security=none#std";
        let link = format!("vmess://{}", BASE64.encode(inner.as_bytes()));

        let factory = parse_link(&link).unwrap();

        assert_eq!(factory.remark, "std");
        assert_eq!(factory.item_address(), "std.example.com");
    }

    #[test]
    fn test_plain_standard_uri() {
        let factory =
            parse_link("vmess://uuid@plain.example.com:8443?encryption=aes-128-gcm#plain").unwrap();

        assert_eq!(factory.item_port(), "8443");
        assert_eq!(
            factory.json().unwrap()["outbounds"][0]["settings"]["vnext"][0]["users"][0]["security"],
            "aes-128-gcm"
        );
    }

    #[test]
    fn test_v2rayn_without_port_fails() {
        let link = encode(&json!({ "v": "2", "add": "x.example.com", "id": "uuid" }));

        assert!(matches!(parse_link(&link), Err(ShareLinkError::Malformed(_))));
    }
}
