// Hysteria 链接
//
// hysteria://host:port?protocol=&auth=&peer=&insecure=&upmbps=&downmbps=&alpn=&obfs=xplus&obfsParam=#remark
// hysteria2://auth@host:port/?sni=&insecure=&obfs=&obfs-password=&pinSHA256=#remark

use serde_json::Value;

use super::codec::{ShareLinkError, build_query, join_host_port, split_uri, url_encode};
use crate::atoms::config_factory::hysteria_builder::{
    DEFAULT_DOWN_MBPS, DEFAULT_UP_MBPS, Hysteria1Server, Hysteria2Server, build_hysteria1,
    build_hysteria2, extract_hysteria1, extract_hysteria2,
};
use crate::atoms::config_factory::{ConfigFactory, ConfigKind};

const DEFAULT_PORT: u16 = 443;

fn is_true(value: Option<&String>) -> bool {
    value.is_some_and(|v| v == "1" || v == "true")
}

pub(super) fn parse_hysteria1(link: &str) -> Result<ConfigFactory, ShareLinkError> {
    let parts = split_uri(link, Some(DEFAULT_PORT))?;
    let params = &parts.params;
    let get = |key: &str| params.get(key).cloned().unwrap_or_default();

    // 旧客户端把认证放在用户信息中
    let auth = match params.get("auth").filter(|a| !a.is_empty()) {
        Some(auth) => auth.clone(),
        None => parts.user.clone(),
    };

    let node = Hysteria1Server {
        server: join_host_port(&parts.host, parts.port),
        protocol: get("protocol"),
        auth,
        peer: get("peer"),
        insecure: is_true(params.get("insecure")),
        up_mbps: get("upmbps").parse().unwrap_or(DEFAULT_UP_MBPS),
        down_mbps: get("downmbps").parse().unwrap_or(DEFAULT_DOWN_MBPS),
        alpn: get("alpn"),
        obfs: get("obfsParam"),
    };

    Ok(ConfigFactory::from_json(ConfigKind::Hysteria1, build_hysteria1(&node)).with_remark(&parts.remark))
}

pub(super) fn parse_hysteria2(link: &str) -> Result<ConfigFactory, ShareLinkError> {
    let parts = split_uri(link, Some(DEFAULT_PORT))?;
    let params = &parts.params;
    let get = |key: &str| params.get(key).cloned().unwrap_or_default();

    let auth = match &parts.password {
        Some(password) => format!("{}:{}", parts.user, password),
        None => parts.user.clone(),
    };

    let node = Hysteria2Server {
        server: join_host_port(&parts.host, parts.port),
        auth,
        sni: get("sni"),
        insecure: is_true(params.get("insecure")),
        obfs: get("obfs"),
        obfs_password: get("obfs-password"),
        pin_sha256: get("pinSHA256"),
    };

    Ok(ConfigFactory::from_json(ConfigKind::Hysteria2, build_hysteria2(&node)).with_remark(&parts.remark))
}

fn push(query: &mut Vec<(String, String)>, key: &str, value: &str) {
    if !value.is_empty() {
        query.push((key.to_string(), value.to_string()));
    }
}

pub(super) fn emit_hysteria1(json: &Value, remark: &str) -> Result<String, ShareLinkError> {
    let node = extract_hysteria1(json).ok_or_else(|| ShareLinkError::malformed("缺少 server 字段"))?;

    let mut query = Vec::new();
    push(&mut query, "protocol", &node.protocol);
    push(&mut query, "auth", &node.auth);
    push(&mut query, "peer", &node.peer);
    if node.insecure {
        push(&mut query, "insecure", "1");
    }
    push(&mut query, "upmbps", &node.up_mbps.to_string());
    push(&mut query, "downmbps", &node.down_mbps.to_string());
    push(&mut query, "alpn", &node.alpn);
    if !node.obfs.is_empty() {
        push(&mut query, "obfs", "xplus");
        push(&mut query, "obfsParam", &node.obfs);
    }

    Ok(format!(
        "hysteria://{}?{}#{}",
        node.server,
        build_query(&query),
        url_encode(remark)
    ))
}

pub(super) fn emit_hysteria2(json: &Value, remark: &str) -> Result<String, ShareLinkError> {
    let node = extract_hysteria2(json).ok_or_else(|| ShareLinkError::malformed("缺少 server 字段"))?;

    let mut query = Vec::new();
    push(&mut query, "sni", &node.sni);
    if node.insecure {
        push(&mut query, "insecure", "1");
    }
    push(&mut query, "obfs", &node.obfs);
    push(&mut query, "obfs-password", &node.obfs_password);
    push(&mut query, "pinSHA256", &node.pin_sha256);

    let userinfo = if node.auth.is_empty() {
        String::new()
    } else {
        format!("{}@", url_encode(&node.auth))
    };

    Ok(format!(
        "hysteria2://{}{}/?{}#{}",
        userinfo,
        node.server,
        build_query(&query),
        url_encode(remark)
    ))
}
