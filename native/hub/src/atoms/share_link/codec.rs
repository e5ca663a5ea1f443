// 分享链接入口：按协议头分派解析与导出

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use std::collections::BTreeMap;
use url::Url;

use super::{hysteria, standard, vmess};
use crate::atoms::config_factory::xray_builder::{self, XrayProxy};
use crate::atoms::config_factory::{ConfigFactory, ConfigKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShareLinkError {
    #[error("不支持的协议：{0}")]
    InvalidScheme(String),
    #[error("分享链接格式错误：{0}")]
    Malformed(String),
}

impl ShareLinkError {
    pub(super) fn malformed(reason: impl Into<String>) -> Self {
        ShareLinkError::Malformed(reason.into())
    }
}

// 宽松 Base64：兼容有无填充与多余尾位
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

// 解码标准或 URL 安全的 Base64，忽略空白字符
pub fn decode_base64_lenient(text: &str) -> Option<Vec<u8>> {
    let clean: String = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    if clean.is_empty() {
        return None;
    }

    LENIENT_BASE64.decode(clean.trim_end_matches('=')).ok()
}

// 协议头（小写）与剩余部分
fn split_scheme(text: &str) -> Result<(String, &str), ShareLinkError> {
    let (scheme, rest) = text
        .split_once("://")
        .ok_or_else(|| ShareLinkError::malformed("缺少 ://"))?;

    Ok((scheme.to_ascii_lowercase(), rest))
}

// 解析单条分享链接
pub fn parse(text: &str) -> Result<ConfigFactory, ShareLinkError> {
    let text = text.trim();
    let (scheme, rest) = split_scheme(text)?;

    match scheme.as_str() {
        "vmess" => vmess::parse(rest),
        "vless" | "trojan" => standard::parse_xray(&scheme, &format!("{}://{}", scheme, rest)),
        "ss" => standard::parse_shadowsocks(rest),
        "hysteria" => hysteria::parse_hysteria1(&format!("hysteria://{}", rest)),
        "hysteria2" | "hy2" => hysteria::parse_hysteria2(&format!("hysteria2://{}", rest)),
        other => Err(ShareLinkError::InvalidScheme(other.to_string())),
    }
}

// 导出分享链接
pub fn emit(factory: &ConfigFactory) -> Result<String, ShareLinkError> {
    let json = factory
        .json()
        .ok_or_else(|| ShareLinkError::malformed("配置不是有效 JSON"))?;

    match factory.kind() {
        ConfigKind::Xray => {
            let node = xray_builder::extract_outbound(json)
                .ok_or_else(|| ShareLinkError::malformed("缺少可识别的代理出站"))?;

            match node.proxy {
                XrayProxy::Vmess { .. } => vmess::emit(&node, &factory.remark),
                XrayProxy::Vless { .. } | XrayProxy::Trojan { .. } => {
                    Ok(standard::emit_xray(&node, &factory.remark))
                }
                XrayProxy::Shadowsocks { .. } => {
                    Ok(standard::emit_shadowsocks(&node, &factory.remark))
                }
            }
        }
        ConfigKind::Hysteria1 => hysteria::emit_hysteria1(json, &factory.remark),
        ConfigKind::Hysteria2 => hysteria::emit_hysteria2(json, &factory.remark),
    }
}

// 通用 URI 结构：user[:password]@host:port?query#remark
#[derive(Debug, Clone)]
pub(super) struct UriParts {
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub params: BTreeMap<String, String>,
    pub remark: String,
}

pub(super) fn url_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

pub(super) fn url_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

// 查询参数（值已解码），重复键以首次出现为准
pub(super) fn parse_query_params(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            params
                .entry(key.to_string())
                .or_insert_with(|| url_decode(value));
        }
    }
    params
}

// 按给定顺序拼接查询串，值做百分号编码
pub(super) fn build_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, url_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// IPv6 地址需加方括号
pub(super) fn join_host_port(host: &str, port: impl std::fmt::Display) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

pub(super) fn split_uri(link: &str, default_port: Option<u16>) -> Result<UriParts, ShareLinkError> {
    let url = Url::parse(link).map_err(|e| ShareLinkError::malformed(format!("URL 解析失败：{}", e)))?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ShareLinkError::malformed("缺少服务器地址"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    let port = url
        .port()
        .or(default_port)
        .ok_or_else(|| ShareLinkError::malformed("缺少端口"))?;

    Ok(UriParts {
        user: url_decode(url.username()),
        password: url.password().map(url_decode),
        host,
        port,
        params: parse_query_params(url.query().unwrap_or("")),
        remark: url_decode(url.fragment().unwrap_or("")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_VMESS: &str = "vmess://eyJ2IjoiMiIsInBzIjoibXkgcyIsImFkZCI6IjEuMi4zLjQiLCJwb3J0IjoiNDQzIiwiaWQiOiJhYWFhYWFhYS1iYmJiLWNjY2MtZGRkZC1lZWVlZWVlZWVlZWUiLCJhaWQiOiIwIiwic2N5IjoiYXV0byIsIm5ldCI6InRjcCIsInRscyI6InRscyJ9";

    fn assert_round_trip(link: &str) -> ConfigFactory {
        let parsed = parse(link).unwrap();
        let emitted = parsed.to_uri().unwrap();
        let reparsed = parse(&emitted).unwrap();

        assert!(
            parsed.equals_ignoring_transient(&reparsed),
            "round trip changed {} into {}",
            link,
            emitted
        );
        parsed
    }

    #[test]
    fn test_vmess_scenario() {
        let factory = assert_round_trip(SCENARIO_VMESS);

        assert_eq!(factory.remark, "my s");
        assert_eq!(factory.item_address(), "1.2.3.4");
        assert_eq!(factory.item_port(), "443");
        assert_eq!(factory.item_transport(), "tcp");
        assert_eq!(factory.item_tls(), "tls");
        assert_eq!(factory.item_protocol(), "VMess");

        let json = factory.json().unwrap();
        assert_eq!(
            json.pointer("/outbounds/0/settings/vnext/0/users/0/id")
                .and_then(|v| v.as_str()),
            Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee")
        );
    }

    #[test]
    fn test_vless_reality_round_trip() {
        let factory = assert_round_trip(
            "vless://8f3c@example.com:443?encryption=none&flow=xtls-rprx-vision&type=tcp&security=reality&sni=www.microsoft.com&fp=chrome&pbk=PUBKEY&sid=6ba8&spx=%2Fpath#Reality%20Node",
        );

        assert_eq!(factory.remark, "Reality Node");
        assert_eq!(factory.item_tls(), "reality");
        let json = factory.json().unwrap();
        assert_eq!(
            json.pointer("/outbounds/0/streamSettings/realitySettings/spiderX")
                .and_then(|v| v.as_str()),
            Some("/path")
        );
        assert_eq!(
            json.pointer("/outbounds/0/settings/vnext/0/users/0/flow")
                .and_then(|v| v.as_str()),
            Some("xtls-rprx-vision")
        );
    }

    #[test]
    fn test_trojan_ws_round_trip() {
        let factory = assert_round_trip(
            "trojan://p%40ss@[2001:db8::1]:8443?type=ws&security=tls&path=%2Fws%3Fed%3D2048&host=cdn.example.com#t",
        );

        assert_eq!(factory.item_address(), "2001:db8::1");
        let json = factory.json().unwrap();
        assert_eq!(
            json.pointer("/outbounds/0/settings/servers/0/password")
                .and_then(|v| v.as_str()),
            Some("p@ss")
        );
        assert_eq!(
            json.pointer("/outbounds/0/streamSettings/wsSettings/path")
                .and_then(|v| v.as_str()),
            Some("/ws?ed=2048")
        );
    }

    #[test]
    fn test_shadowsocks_forms() {
        // SIP002 Base64 用户信息
        let sip002 = assert_round_trip("ss://YWVzLTI1Ni1nY206cGFzcw@1.2.3.4:8388#ss%20node");
        // 旧式整体 Base64：aes-256-gcm:pass@1.2.3.4:8388
        let legacy = parse("ss://YWVzLTI1Ni1nY206cGFzc0AxLjIuMy40OjgzODg#ss%20node").unwrap();
        // 明文用户信息
        let plain = parse("ss://aes-256-gcm:pass@1.2.3.4:8388#ss%20node").unwrap();

        assert!(sip002.equals_ignoring_transient(&legacy));
        assert!(sip002.equals_ignoring_transient(&plain));
        assert_eq!(sip002.item_protocol(), "Shadowsocks");
    }

    #[test]
    fn test_hysteria_round_trips() {
        let hy1 = assert_round_trip(
            "hysteria://hy.example.com:443?protocol=udp&auth=secret&peer=sni.example.com&insecure=1&upmbps=20&downmbps=100&alpn=hysteria&obfs=xplus&obfsParam=key#hy1",
        );
        let hy2 = assert_round_trip(
            "hysteria2://user%3Apass@hy2.example.com:8443/?sni=real.example.com&obfs=salamander&obfs-password=cry#hy2",
        );
        let alias = parse("hy2://letmein@hy2.example.com:443#alias").unwrap();

        assert_eq!(hy1.kind(), ConfigKind::Hysteria1);
        assert_eq!(hy1.json().unwrap()["obfs"], "key");
        assert_eq!(hy1.json().unwrap()["up_mbps"], 20);
        assert_eq!(hy2.kind(), ConfigKind::Hysteria2);
        assert_eq!(hy2.json().unwrap()["auth"], "user:pass");
        assert_eq!(alias.kind(), ConfigKind::Hysteria2);
        assert_eq!(alias.json().unwrap()["auth"], "letmein");
    }

    #[test]
    fn test_failure_modes() {
        assert!(matches!(
            parse("just some text"),
            Err(ShareLinkError::Malformed(_))
        ));
        assert_eq!(
            parse("gopher://host:70").err(),
            Some(ShareLinkError::InvalidScheme("gopher".to_string()))
        );
        assert!(matches!(
            parse("vmess://@@not-base64@@"),
            Err(ShareLinkError::Malformed(_))
        ));
        assert!(matches!(
            parse("vless://id@host-without-port"),
            Err(ShareLinkError::Malformed(_))
        ));
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let factory = parse("VLESS://id@example.com:443?type=grpc&serviceName=svc&mode=multi#g").unwrap();

        assert_eq!(factory.item_transport(), "grpc");
        assert_eq!(
            factory.json().unwrap()["outbounds"][0]["streamSettings"]["grpcSettings"]["multiMode"],
            true
        );
    }

    #[test]
    fn test_lenient_base64() {
        assert_eq!(decode_base64_lenient("aGk=").as_deref(), Some(&b"hi"[..]));
        assert_eq!(decode_base64_lenient("aGk").as_deref(), Some(&b"hi"[..]));
        assert_eq!(decode_base64_lenient(" aG\nk= ").as_deref(), Some(&b"hi"[..]));
        assert_eq!(decode_base64_lenient("Pz8-").as_deref(), Some(&b"??>"[..]));
        assert_eq!(decode_base64_lenient(""), None);
        assert_eq!(decode_base64_lenient("@@"), None);
    }
}
