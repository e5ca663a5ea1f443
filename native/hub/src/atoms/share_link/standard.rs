// 标准 URI 形式：vless / trojan / vmess（非 v2rayN）/ shadowsocks

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::collections::BTreeMap;

use super::codec::{
    ShareLinkError, build_query, decode_base64_lenient, join_host_port, split_uri, url_decode,
    url_encode,
};
use crate::atoms::config_factory::xray_builder::{self, Kwargs, XrayOutbound, XrayProxy};
use crate::atoms::config_factory::{ConfigFactory, ConfigKind};

// 参与 streamSettings 构建的查询参数
const STREAM_KEYS: [&str; 14] = [
    "headerType",
    "seed",
    "path",
    "host",
    "quicSecurity",
    "key",
    "serviceName",
    "mode",
    "fp",
    "sni",
    "alpn",
    "pbk",
    "sid",
    "spx",
];

fn param_or(params: &BTreeMap<String, String>, key: &str, default: &str) -> String {
    params
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn stream_kwargs(params: &BTreeMap<String, String>) -> Kwargs {
    STREAM_KEYS
        .iter()
        .filter_map(|key| {
            params
                .get(*key)
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v.clone()))
        })
        .collect()
}

pub(super) fn factory_from_outbound(node: &XrayOutbound, remark: &str) -> ConfigFactory {
    ConfigFactory::from_json(ConfigKind::Xray, xray_builder::build_config(node)).with_remark(remark)
}

pub(super) fn parse_xray(scheme: &str, link: &str) -> Result<ConfigFactory, ShareLinkError> {
    let parts = split_uri(link, None)?;

    let user = match &parts.password {
        Some(password) => format!("{}:{}", parts.user, password),
        None => parts.user.clone(),
    };
    if user.is_empty() {
        return Err(ShareLinkError::malformed("缺少用户标识"));
    }

    let params = &parts.params;
    let proxy = match scheme {
        "vless" => XrayProxy::Vless {
            id: user,
            encryption: param_or(params, "encryption", "none"),
            flow: param_or(params, "flow", ""),
        },
        "trojan" => XrayProxy::Trojan { password: user },
        "vmess" => XrayProxy::Vmess {
            id: user,
            alter_id: param_or(params, "aid", "0").parse().unwrap_or(0),
            security: param_or(params, "encryption", "auto"),
        },
        other => return Err(ShareLinkError::InvalidScheme(other.to_string())),
    };

    let node = XrayOutbound {
        address: parts.host,
        port: parts.port,
        proxy,
        network: param_or(params, "type", "tcp"),
        security: param_or(params, "security", "none"),
        kwargs: stream_kwargs(params),
    };

    Ok(factory_from_outbound(&node, &parts.remark))
}

pub(super) fn emit_xray(node: &XrayOutbound, remark: &str) -> String {
    let mut query: Vec<(String, String)> = Vec::new();

    let (scheme, user) = match &node.proxy {
        XrayProxy::Vless {
            id,
            encryption,
            flow,
        } => {
            query.push(("encryption".to_string(), encryption.clone()));
            if !flow.is_empty() {
                query.push(("flow".to_string(), flow.clone()));
            }
            ("vless", id.clone())
        }
        XrayProxy::Trojan { password } => ("trojan", password.clone()),
        XrayProxy::Vmess {
            id,
            alter_id,
            security,
        } => {
            query.push(("encryption".to_string(), security.clone()));
            if *alter_id != 0 {
                query.push(("aid".to_string(), alter_id.to_string()));
            }
            ("vmess", id.clone())
        }
        XrayProxy::Shadowsocks { .. } => return emit_shadowsocks(node, remark),
    };

    query.push(("type".to_string(), node.network.clone()));
    query.push(("security".to_string(), node.security.clone()));
    query.extend(node.kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));

    format!(
        "{}://{}@{}?{}#{}",
        scheme,
        url_encode(&user),
        join_host_port(&node.address, node.port),
        build_query(&query),
        url_encode(remark)
    )
}

fn split_host_port(text: &str) -> Result<(String, u16), ShareLinkError> {
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| ShareLinkError::malformed("缺少端口"))?;

    let port = port
        .parse::<u16>()
        .map_err(|_| ShareLinkError::malformed(format!("端口解析失败：{}", port)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ShareLinkError::malformed("缺少服务器地址"));
    }

    Ok((host.to_string(), port))
}

fn decode_utf8_base64(text: &str) -> Result<String, ShareLinkError> {
    let bytes =
        decode_base64_lenient(text).ok_or_else(|| ShareLinkError::malformed("Base64 解码失败"))?;
    String::from_utf8(bytes).map_err(|_| ShareLinkError::malformed("UTF-8 转换失败"))
}

// ss://userinfo@host:port#remark（SIP002）或 ss://base64(method:password@host:port)#remark
pub(super) fn parse_shadowsocks(rest: &str) -> Result<ConfigFactory, ShareLinkError> {
    let (main, remark) = match rest.split_once('#') {
        Some((main, remark)) => (main, url_decode(remark)),
        None => (rest, String::new()),
    };

    // 插件参数不参与 Xray 出站构建
    let main = main.split_once('?').map(|(m, _)| m).unwrap_or(main);
    let main = main.trim_end_matches('/');

    let (userinfo, server) = match main.rsplit_once('@') {
        Some((userinfo, server)) => {
            let decoded = url_decode(userinfo);
            let userinfo = if decoded.contains(':') {
                decoded
            } else {
                decode_utf8_base64(userinfo)?
            };
            (userinfo, server.to_string())
        }
        None => {
            let decoded = decode_utf8_base64(main)?;
            let (userinfo, server) = decoded
                .rsplit_once('@')
                .ok_or_else(|| ShareLinkError::malformed("SS 链接格式错误：缺少 @"))?;
            (userinfo.to_string(), server.to_string())
        }
    };

    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| ShareLinkError::malformed("SS 认证格式错误"))?;
    let (address, port) = split_host_port(&server)?;

    let node = XrayOutbound {
        address,
        port,
        proxy: XrayProxy::Shadowsocks {
            method: method.to_string(),
            password: password.to_string(),
        },
        network: "tcp".to_string(),
        security: "none".to_string(),
        kwargs: Kwargs::new(),
    };

    Ok(factory_from_outbound(&node, &remark))
}

pub(super) fn emit_shadowsocks(node: &XrayOutbound, remark: &str) -> String {
    let userinfo = match &node.proxy {
        XrayProxy::Shadowsocks { method, password } => format!("{}:{}", method, password),
        _ => String::new(),
    };

    format!(
        "ss://{}@{}#{}",
        URL_SAFE_NO_PAD.encode(userinfo.as_bytes()),
        join_host_port(&node.address, node.port),
        url_encode(remark)
    )
}
