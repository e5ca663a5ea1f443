// L0 原子层模块入口：无业务编排的基础能力

pub mod config_factory;
pub mod privilege;
pub mod settings_store;
pub mod share_link;
pub mod system_proxy;

pub use config_factory::{ConfigFactory, ConfigKind, DeletionToken, FactoryId};
pub use settings_store::{SettingKind, SettingsError, SettingsStore};
pub use share_link::ShareLinkError;
pub use system_proxy::SystemProxyController;
