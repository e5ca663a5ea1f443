// 路由物化：启动前按路由模式改写配置副本

use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

use super::mode::RoutingMode;

const DEFAULT_ACCESS_LOG: &str = "logs/xray-access.log";
const DEFAULT_ERROR_LOG: &str = "logs/xray-error.log";

pub const HYSTERIA_ASSET_DIR: &str = "hysteria";
pub const COUNTRY_MMDB: &str = "country.mmdb";

fn rule(outbound: &str, key: &str, values: Value) -> Value {
    json!({
        "type": "field",
        key: values,
        "outboundTag": outbound,
    })
}

// 分流规则：广告拦截、国内域名直连、私有与国内 IP 直连、其余走代理
fn bypass_routing(ads: &str, domains: &[&str], ips: &[&str]) -> Value {
    json!({
        "domainStrategy": "IPIfNonMatch",
        "domainMatcher": "hybrid",
        "rules": [
            rule("block", "domain", json!([ads])),
            rule("direct", "domain", json!(domains)),
            rule("direct", "ip", json!(ips)),
            {
                "type": "field",
                "port": "0-65535",
                "outboundTag": "proxy",
            },
        ],
    })
}

// 计算路由对象；Custom 沿用配置自带的 routing
pub fn routing_object(mode: RoutingMode, existing: Option<&Value>) -> Value {
    match mode {
        RoutingMode::BypassMainlandChina => bypass_routing(
            "geosite:category-ads-all",
            &["geosite:cn"],
            &["geoip:private", "geoip:cn"],
        ),
        RoutingMode::BypassIran => bypass_routing(
            "ext:iran.dat:ads",
            &["ext:iran.dat:ir", "ext:iran.dat:other"],
            &["geoip:private", "geoip:ir"],
        ),
        RoutingMode::Global => json!({}),
        RoutingMode::Custom => existing.cloned().unwrap_or_else(|| json!({})),
    }
}

// 相对路径按安装目录解析；空值使用默认日志文件
fn resolve_log_path(value: Option<&Value>, default: &str, install_root: &Path) -> Option<PathBuf> {
    let raw = value.and_then(Value::as_str).unwrap_or("").trim();

    // none 表示关闭该日志
    if raw.eq_ignore_ascii_case("none") {
        return None;
    }

    let path = PathBuf::from(if raw.is_empty() { default } else { raw });
    if path.is_absolute() {
        Some(path)
    } else {
        Some(install_root.join(path))
    }
}

fn ensure_file(path: &Path) -> Result<(), String> {
    if path.exists() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("创建日志目录失败 {}：{}", parent.display(), e))?;
    }

    std::fs::File::create(path)
        .map(|_| ())
        .map_err(|e| format!("创建日志文件失败 {}：{}", path.display(), e))
}

// Xray 类配置：日志路径绝对化并创建文件，覆盖 routing
pub fn materialize_xray(config: &mut Value, mode: RoutingMode, install_root: &Path) -> Result<(), String> {
    let root = config
        .as_object_mut()
        .ok_or_else(|| "配置不是 JSON 对象".to_string())?;

    let log_block = root
        .entry("log")
        .or_insert_with(|| Value::Object(Map::new()));
    if !log_block.is_object() {
        *log_block = Value::Object(Map::new());
    }

    for (key, default) in [("access", DEFAULT_ACCESS_LOG), ("error", DEFAULT_ERROR_LOG)] {
        if let Some(path) = resolve_log_path(log_block.get(key), default, install_root) {
            ensure_file(&path)?;
            log_block[key] = json!(path.to_string_lossy());
        }
    }

    let routing = routing_object(mode, root.get("routing"));
    root.insert("routing".to_string(), routing);

    log::debug!("已按 {} 模式物化 Xray 路由", mode);
    Ok(())
}

// Hysteria1 分流规则与 GeoIP 数据库
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HysteriaRules {
    pub rule: Vec<u8>,
    pub mmdb: Vec<u8>,
}

impl HysteriaRules {
    // 空规则等同 Global
    pub fn is_global(&self) -> bool {
        self.rule.is_empty()
    }
}

fn read_pair(acl: &Path, mmdb: &Path) -> Option<HysteriaRules> {
    match (std::fs::read(acl), std::fs::read(mmdb)) {
        (Ok(rule), Ok(mmdb)) => Some(HysteriaRules { rule, mmdb }),
        (Err(e), _) => {
            log::warn!("读取 ACL 失败 {}：{}，按 Global 处理", acl.display(), e);
            None
        }
        (_, Err(e)) => {
            log::warn!("读取 mmdb 失败 {}：{}，按 Global 处理", mmdb.display(), e);
            None
        }
    }
}

fn config_path(config: &Value, key: &str, install_root: &Path) -> Option<PathBuf> {
    let raw = config.get(key)?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }

    let path = PathBuf::from(raw);
    Some(if path.is_absolute() {
        path
    } else {
        install_root.join(path)
    })
}

// 内置模式读取打包的 .acl / .mmdb，Custom 读取配置中的 acl / mmdb；
// 任一文件缺失时返回空规则
pub fn hysteria1_rules(
    config: &Value,
    mode: RoutingMode,
    assets_dir: &Path,
    install_root: &Path,
) -> HysteriaRules {
    let hysteria_dir = assets_dir.join(HYSTERIA_ASSET_DIR);

    let pair = match mode {
        RoutingMode::Global => None,
        RoutingMode::BypassMainlandChina | RoutingMode::BypassIran => {
            let acl = hysteria_dir.join(format!("{}.acl", mode.file_stem()));
            read_pair(&acl, &hysteria_dir.join(COUNTRY_MMDB))
        }
        RoutingMode::Custom => {
            match (
                config_path(config, "acl", install_root),
                config_path(config, "mmdb", install_root),
            ) {
                (Some(acl), Some(mmdb)) => read_pair(&acl, &mmdb),
                _ => None,
            }
        }
    };

    pair.unwrap_or_default()
}

// 将规则写到配置旁并指向它们，返回写出的文件；Global 时移除 acl / mmdb
pub fn apply_hysteria1_rules(
    config: &mut Value,
    rules: &HysteriaRules,
    dir: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>, String> {
    let root = config
        .as_object_mut()
        .ok_or_else(|| "配置不是 JSON 对象".to_string())?;

    if rules.is_global() {
        root.remove("acl");
        root.remove("mmdb");
        return Ok(Vec::new());
    }

    std::fs::create_dir_all(dir).map_err(|e| format!("创建目录失败 {}：{}", dir.display(), e))?;

    let acl_path = dir.join(format!("{}.acl", stem));
    let mmdb_path = dir.join(format!("{}.mmdb", stem));

    std::fs::write(&acl_path, &rules.rule)
        .map_err(|e| format!("写入 ACL 失败 {}：{}", acl_path.display(), e))?;
    std::fs::write(&mmdb_path, &rules.mmdb)
        .map_err(|e| format!("写入 mmdb 失败 {}：{}", mmdb_path.display(), e))?;

    root.insert("acl".to_string(), json!(acl_path.to_string_lossy()));
    root.insert("mmdb".to_string(), json!(mmdb_path.to_string_lossy()));
    Ok(vec![acl_path, mmdb_path])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_mainland_china_xray() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = json!({
            "inbounds": [],
            "outbounds": [{ "tag": "proxy", "protocol": "vless" }],
        });

        materialize_xray(&mut config, RoutingMode::BypassMainlandChina, dir.path()).unwrap();

        let rules = config["routing"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0]["outboundTag"], "block");
        assert_eq!(rules[3]["port"], "0-65535");
        assert_eq!(rules[3]["outboundTag"], "proxy");
        assert_eq!(config["routing"]["domainStrategy"], "IPIfNonMatch");

        // 日志路径绝对化且文件已创建
        let access = PathBuf::from(config["log"]["access"].as_str().unwrap());
        assert!(access.is_absolute());
        assert!(access.exists());
        assert!(PathBuf::from(config["log"]["error"].as_str().unwrap()).exists());
    }

    #[test]
    fn test_routing_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let custom = json!({ "rules": [{ "type": "field", "port": "53", "outboundTag": "direct" }] });
        let mut config = json!({ "routing": custom.clone(), "log": { "access": "none" } });

        let mut kept = config.clone();
        materialize_xray(&mut kept, RoutingMode::Custom, dir.path()).unwrap();
        assert_eq!(kept["routing"], custom);
        assert_eq!(kept["log"]["access"], "none");

        materialize_xray(&mut config, RoutingMode::Global, dir.path()).unwrap();
        assert_eq!(config["routing"], json!({}));

        assert_eq!(routing_object(RoutingMode::Custom, None), json!({}));
        assert_eq!(
            routing_object(RoutingMode::BypassIran, None)["rules"][2]["ip"],
            json!(["geoip:private", "geoip:ir"])
        );
    }

    #[test]
    fn test_hysteria1_rules() {
        let root = tempfile::tempdir().unwrap();
        let assets = root.path().join("assets");
        let hysteria_dir = assets.join(HYSTERIA_ASSET_DIR);
        std::fs::create_dir_all(&hysteria_dir).unwrap();
        std::fs::write(hysteria_dir.join("bypass-mainland-china.acl"), b"direct country cn").unwrap();
        std::fs::write(hysteria_dir.join(COUNTRY_MMDB), b"mmdb").unwrap();

        let config = json!({ "server": "h:443" });

        let rules = hysteria1_rules(&config, RoutingMode::BypassMainlandChina, &assets, root.path());
        assert_eq!(rules.rule, b"direct country cn");
        assert_eq!(rules.mmdb, b"mmdb");

        // 缺少 iran 规则文件时按 Global 处理
        assert!(hysteria1_rules(&config, RoutingMode::BypassIran, &assets, root.path()).is_global());
        assert!(hysteria1_rules(&config, RoutingMode::Global, &assets, root.path()).is_global());
        assert!(hysteria1_rules(&config, RoutingMode::Custom, &assets, root.path()).is_global());

        let custom = json!({
            "server": "h:443",
            "acl": "assets/hysteria/bypass-mainland-china.acl",
            "mmdb": "assets/hysteria/country.mmdb",
        });
        assert_eq!(
            hysteria1_rules(&custom, RoutingMode::Custom, &assets, root.path()),
            rules
        );

        let mut launched = custom.clone();
        let written =
            apply_hysteria1_rules(&mut launched, &rules, &root.path().join("data"), "hysteria_1").unwrap();
        let acl = PathBuf::from(launched["acl"].as_str().unwrap());
        assert_eq!(written, vec![acl.clone(), PathBuf::from(launched["mmdb"].as_str().unwrap())]);
        assert_eq!(std::fs::read(acl).unwrap(), b"direct country cn");

        let written = apply_hysteria1_rules(&mut launched, &HysteriaRules::default(), root.path(), "x").unwrap();
        assert!(written.is_empty());
        assert!(launched.get("acl").is_none());
    }
}
