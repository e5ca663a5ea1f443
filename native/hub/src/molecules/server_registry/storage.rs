// 服务器列表与订阅映射的持久化格式
//
// 服务器列表：[{ "kind", "config", "remark", "subsId" }]，config 为 JSON 对象或原始文本
// 订阅映射：{ id: { "remark", "webURL" } }
// 旧版订阅：[{ "remark", "webURL" }]，首次加载时迁移为映射

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::registry::{ServerRegistry, Subscription, new_subscription_id};
use crate::atoms::config_factory::ConfigBody;
use crate::atoms::{ConfigFactory, ConfigKind};

#[derive(Debug, Serialize, Deserialize)]
struct StoredFactory {
    kind: ConfigKind,
    config: Value,
    #[serde(default)]
    remark: String,
    #[serde(rename = "subsId", default)]
    subs_id: String,
}

impl StoredFactory {
    fn from_factory(factory: &ConfigFactory) -> Self {
        let config = match factory.body() {
            ConfigBody::Json(value) => value.clone(),
            ConfigBody::Text(text) => Value::String(text.clone()),
        };

        Self {
            kind: factory.kind(),
            config,
            remark: factory.remark.clone(),
            subs_id: factory.subs_id.clone(),
        }
    }

    fn into_factory(self) -> ConfigFactory {
        let mut factory = match self.config {
            Value::String(text) => ConfigFactory::from_text(self.kind, &text),
            value => ConfigFactory::from_json(self.kind, value),
        };
        factory.remark = self.remark;
        factory.subs_id = self.subs_id;
        factory
    }
}

// 加载结果
#[derive(Debug)]
pub struct LoadedRegistry {
    pub registry: ServerRegistry,
    // 旧版订阅已迁移，调用方应清空旧键并保存新映射
    pub migrated_legacy: bool,
}

impl ServerRegistry {
    pub fn servers_json(&self) -> Result<String, String> {
        let stored: Vec<StoredFactory> = self
            .factories()
            .iter()
            .map(StoredFactory::from_factory)
            .collect();

        serde_json::to_string(&stored).map_err(|e| format!("序列化服务器列表失败：{}", e))
    }

    pub fn subscriptions_json(&self) -> Result<String, String> {
        serde_json::to_string(self.subscriptions())
            .map_err(|e| format!("序列化订阅失败：{}", e))
    }

    // 从持久化文本恢复；损坏的部分记录警告后按空处理
    pub fn load(servers: &str, subscriptions: &str, legacy: &str, activated: i64) -> LoadedRegistry {
        let factories: Vec<ConfigFactory> = match serde_json::from_str::<Vec<StoredFactory>>(servers) {
            Ok(stored) => stored.into_iter().map(StoredFactory::into_factory).collect(),
            Err(e) => {
                log::warn!("服务器列表解析失败，使用空列表：{}", e);
                Vec::new()
            }
        };

        let mut subscriptions: BTreeMap<String, Subscription> = if subscriptions.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(subscriptions).unwrap_or_else(|e| {
                log::warn!("订阅映射解析失败，使用空映射：{}", e);
                BTreeMap::new()
            })
        };

        let legacy_entries: Vec<Subscription> = if legacy.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(legacy).unwrap_or_else(|e| {
                log::warn!("旧版订阅解析失败，跳过迁移：{}", e);
                Vec::new()
            })
        };

        let migrated_legacy = !legacy_entries.is_empty();

        // 迁移时跳过已存在的订阅地址
        for entry in legacy_entries {
            if subscriptions.values().any(|s| s.web_url == entry.web_url) {
                continue;
            }
            let id = new_subscription_id(&subscriptions);
            subscriptions.insert(id, entry);
        }

        if migrated_legacy {
            log::info!("旧版订阅已迁移，当前共 {} 个订阅", subscriptions.len());
        }

        // 引用不存在订阅的条目视为手动导入
        let factories = factories
            .into_iter()
            .map(|mut f| {
                if !f.subs_id.is_empty() && !subscriptions.contains_key(&f.subs_id) {
                    f.subs_id.clear();
                }
                f
            })
            .collect();

        LoadedRegistry {
            registry: ServerRegistry::from_parts(factories, subscriptions, activated),
            migrated_legacy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_and_load() {
        let mut registry = ServerRegistry::new();
        let subs_id = registry.add_subscription("s", "https://example.com/sub");

        let mut json_item =
            ConfigFactory::from_json(ConfigKind::Hysteria2, json!({ "server": "h:443" })).with_remark("hy2");
        json_item.subs_id = subs_id.clone();
        json_item.delay_result = "10ms".to_string();
        registry.append(json_item);
        registry.append(ConfigFactory::from_text(ConfigKind::Xray, "").with_remark("placeholder"));
        registry.activate(1, true);

        let loaded = ServerRegistry::load(
            &registry.servers_json().unwrap(),
            &registry.subscriptions_json().unwrap(),
            "",
            registry.activated_index(),
        );
        let restored = loaded.registry;

        assert!(!loaded.migrated_legacy);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.activated_index(), 1);
        assert!(restored.get(0).unwrap().equals_ignoring_transient(registry.get(0).unwrap()));
        // 测试结果不持久化
        assert!(restored.get(0).unwrap().delay_result.is_empty());
        assert_eq!(restored.get(1).unwrap().to_json_string(), "");
        assert_eq!(restored.subscriptions().get(&subs_id).unwrap().remark, "s");
    }

    #[test]
    fn test_legacy_subscriptions_are_migrated() {
        let existing = json!({ "abc": { "remark": "old", "webURL": "https://a.example.com" } }).to_string();
        let legacy = json!([
            { "remark": "dup", "webURL": "https://a.example.com" },
            { "remark": "new", "webURL": "https://b.example.com" },
        ])
        .to_string();

        let loaded = ServerRegistry::load("[]", &existing, &legacy, -1);
        let subscriptions = loaded.registry.subscriptions();

        assert!(loaded.migrated_legacy);
        assert_eq!(subscriptions.len(), 2);
        assert!(subscriptions.values().any(|s| s.remark == "new"));
    }

    #[test]
    fn test_corrupt_state_loads_empty() {
        let loaded = ServerRegistry::load("{oops", "[1]", "", 3);

        assert!(loaded.registry.is_empty());
        assert!(loaded.registry.subscriptions().is_empty());
        assert_eq!(loaded.registry.activated_index(), -1);
    }

    #[test]
    fn test_dangling_subs_id_is_cleared() {
        let servers = json!([
            { "kind": "Hysteria2", "config": { "server": "h:1" }, "remark": "a", "subsId": "gone" }
        ])
        .to_string();

        let loaded = ServerRegistry::load(&servers, "{}", "", 0);

        assert!(loaded.registry.get(0).unwrap().subs_id.is_empty());
        assert_eq!(loaded.registry.activated_index(), 0);
    }
}
