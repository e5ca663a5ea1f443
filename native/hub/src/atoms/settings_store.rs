// 设置存储原子模块

pub mod backend;
pub mod store;

pub use backend::{JsonFileBackend, MemoryBackend, SettingsBackend};
pub use store::{SettingKind, SettingsError, SettingsStore, keys, register_application_settings};
