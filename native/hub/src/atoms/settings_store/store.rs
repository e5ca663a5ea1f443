// 类型化设置存储
//
// 每个设置项需先注册（名称、类型、默认值、可选取值范围）才能读写。
// 读取到越界值时静默改写为默认值。

use std::collections::BTreeMap;

use super::backend::SettingsBackend;

// 设置项名称
pub mod keys {
    pub const CONNECT: &str = "Connect";
    pub const ROUTING: &str = "Routing";
    pub const VPN_MODE: &str = "VPNMode";
    pub const STARTUP_ON_BOOT: &str = "StartupOnBoot";
    pub const SHOW_PROGRESS_BAR_WHEN_CONNECTING: &str = "ShowProgressBarWhenConnecting";
    pub const SHOW_TAB_AND_SPACES_IN_EDITOR: &str = "ShowTabAndSpacesInEditor";
    pub const LANGUAGE: &str = "Language";
    pub const ACTIVATED_ITEM_INDEX: &str = "ActivatedItemIndex";
    pub const CONFIGURATION: &str = "Configuration";
    pub const SUBSCRIPTIONS: &str = "Subscriptions";
    pub const LEGACY_SUBSCRIPTION: &str = "CustomSubscription";
    pub const PROXY_BYPASS_LIST: &str = "ProxyBypassList";
    pub const MAIN_WINDOW_GEOMETRY: &str = "MainWindowGeometry";
    pub const SERVER_WIDGET_SECTION_SIZES: &str = "ServerWidgetSectionSizes";
}

pub const ROUTING_MODES: [&str; 4] = ["Bypass Mainland China", "Bypass Iran", "Global", "Custom"];
pub const LANGUAGES: [&str; 5] = ["EN", "ES", "RU", "ZH", "FA"];
pub const DEFAULT_BYPASS_LIST: &str = "localhost;127.*;10.*;172.16.*;172.17.*;172.18.*;172.19.*;\
172.20.*;172.21.*;172.22.*;172.23.*;172.24.*;172.25.*;172.26.*;172.27.*;172.28.*;172.29.*;\
172.30.*;172.31.*;192.168.*;<local>";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("设置项未注册：{0}")]
    Missing(String),
    #[error("设置项 {name} 的取值 {value} 不在允许范围内")]
    OutOfRange { name: String, value: String },
    #[error("设置写入失败：{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    // 以 "0"/"1" 存储的开关
    Binary,
    // 任意字符串，可选取值范围
    Free,
}

#[derive(Debug, Clone)]
struct SettingDef {
    kind: SettingKind,
    default: String,
    valid_range: Option<Vec<String>>,
}

impl SettingDef {
    fn accepts(&self, value: &str) -> bool {
        match &self.valid_range {
            Some(range) => range.iter().any(|v| v == value),
            None => true,
        }
    }
}

pub struct SettingsStore {
    defs: BTreeMap<String, SettingDef>,
    backend: Box<dyn SettingsBackend>,
}

impl SettingsStore {
    pub fn new(backend: Box<dyn SettingsBackend>) -> Self {
        Self {
            defs: BTreeMap::new(),
            backend,
        }
    }

    // 注册设置项；二值设置项的取值范围固定为 "0"/"1"
    pub fn register(
        &mut self,
        name: &str,
        kind: SettingKind,
        default: &str,
        valid_range: Option<&[&str]>,
    ) {
        let valid_range = match kind {
            SettingKind::Binary => Some(vec!["0".to_string(), "1".to_string()]),
            SettingKind::Free => valid_range.map(|r| r.iter().map(|v| v.to_string()).collect()),
        };

        self.defs.insert(
            name.to_string(),
            SettingDef {
                kind,
                default: default.to_string(),
                valid_range,
            },
        );
    }

    fn def(&self, name: &str) -> Result<&SettingDef, SettingsError> {
        self.defs
            .get(name)
            .ok_or_else(|| SettingsError::Missing(name.to_string()))
    }

    pub fn kind(&self, name: &str) -> Result<SettingKind, SettingsError> {
        self.def(name).map(|s| s.kind)
    }

    pub fn get(&mut self, name: &str) -> Result<String, SettingsError> {
        let def = self.def(name)?.clone();

        match self.backend.read(name) {
            Some(value) if def.accepts(&value) => Ok(value),
            Some(value) => {
                log::warn!(
                    "设置项 {} 的存储值 {} 越界，重置为默认值 {}",
                    name,
                    value,
                    def.default
                );
                if let Err(e) = self.backend.write(name, &def.default) {
                    log::error!("重置设置项 {} 失败：{}", name, e);
                }
                Ok(def.default)
            }
            None => Ok(def.default),
        }
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<(), SettingsError> {
        let def = self.def(name)?;

        if !def.accepts(value) {
            return Err(SettingsError::OutOfRange {
                name: name.to_string(),
                value: value.to_string(),
            });
        }

        self.backend
            .write(name, value)
            .map_err(SettingsError::Backend)
    }

    pub fn is_on(&mut self, name: &str) -> Result<bool, SettingsError> {
        Ok(self.get(name)? == "1")
    }

    pub fn turn_on(&mut self, name: &str) -> Result<(), SettingsError> {
        self.set(name, "1")
    }

    pub fn turn_off(&mut self, name: &str) -> Result<(), SettingsError> {
        self.set(name, "0")
    }
}

// 注册应用使用的全部设置项
pub fn register_application_settings(store: &mut SettingsStore) {
    use SettingKind::{Binary, Free};

    store.register(keys::CONNECT, Binary, "0", None);
    store.register(keys::ROUTING, Free, ROUTING_MODES[0], Some(&ROUTING_MODES[..]));
    store.register(keys::VPN_MODE, Binary, "0", None);
    store.register(keys::STARTUP_ON_BOOT, Binary, "1", None);
    store.register(keys::SHOW_PROGRESS_BAR_WHEN_CONNECTING, Binary, "1", None);
    store.register(keys::SHOW_TAB_AND_SPACES_IN_EDITOR, Binary, "0", None);
    store.register(keys::LANGUAGE, Free, LANGUAGES[0], Some(&LANGUAGES[..]));
    store.register(keys::ACTIVATED_ITEM_INDEX, Free, "-1", None);
    store.register(keys::CONFIGURATION, Free, "[]", None);
    store.register(keys::SUBSCRIPTIONS, Free, "{}", None);
    store.register(keys::LEGACY_SUBSCRIPTION, Free, "", None);
    store.register(keys::PROXY_BYPASS_LIST, Free, DEFAULT_BYPASS_LIST, None);
    store.register(keys::MAIN_WINDOW_GEOMETRY, Free, "", None);
    store.register(keys::SERVER_WIDGET_SECTION_SIZES, Free, "", None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::settings_store::MemoryBackend;

    fn store() -> SettingsStore {
        let mut store = SettingsStore::new(Box::new(MemoryBackend::new()));
        register_application_settings(&mut store);
        store
    }

    #[test]
    fn test_defaults_for_unset_values() {
        let mut store = store();

        assert_eq!(store.get(keys::ROUTING).unwrap(), "Bypass Mainland China");
        assert!(store.is_on(keys::STARTUP_ON_BOOT).unwrap());
        assert!(!store.is_on(keys::CONNECT).unwrap());
        assert_eq!(store.get(keys::ACTIVATED_ITEM_INDEX).unwrap(), "-1");
    }

    #[test]
    fn test_unknown_name_is_missing() {
        let mut store = store();

        assert_eq!(
            store.get("NoSuchSetting"),
            Err(SettingsError::Missing("NoSuchSetting".to_string()))
        );
        assert!(matches!(
            store.set("NoSuchSetting", "1"),
            Err(SettingsError::Missing(_))
        ));
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut store = store();

        assert!(matches!(
            store.set(keys::ROUTING, "Everything"),
            Err(SettingsError::OutOfRange { .. })
        ));
        assert!(matches!(
            store.set(keys::CONNECT, "yes"),
            Err(SettingsError::OutOfRange { .. })
        ));

        store.set(keys::ROUTING, "Global").unwrap();
        assert_eq!(store.get(keys::ROUTING).unwrap(), "Global");
    }

    #[test]
    fn test_out_of_range_stored_value_is_rewritten() {
        let mut backend = MemoryBackend::new();
        backend.write(keys::LANGUAGE, "Klingon").unwrap();

        let mut store = SettingsStore::new(Box::new(backend));
        register_application_settings(&mut store);

        assert_eq!(store.get(keys::LANGUAGE).unwrap(), "EN");
        // 第二次读取到的已是被改写后的默认值
        assert_eq!(store.get(keys::LANGUAGE).unwrap(), "EN");
    }

    #[test]
    fn test_binary_toggle() {
        let mut store = store();

        store.turn_on(keys::VPN_MODE).unwrap();
        assert!(store.is_on(keys::VPN_MODE).unwrap());
        store.turn_off(keys::VPN_MODE).unwrap();
        assert!(!store.is_on(keys::VPN_MODE).unwrap());
    }
}
