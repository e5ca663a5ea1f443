// 代理配置工厂：多协议配置值、派生访问器与构建器

pub mod factory;
pub mod hysteria_builder;
pub mod xray_builder;

pub use factory::{ConfigBody, ConfigFactory, ConfigKind, DeletionToken, FactoryId};
pub use xray_builder::Kwargs;
