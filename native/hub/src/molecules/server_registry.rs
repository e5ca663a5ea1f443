// 服务器注册表分子模块

pub mod registry;
pub mod storage;

pub use registry::{DeleteOutcome, ServerRegistry, SortColumn, Subscription};
pub use storage::LoadedRegistry;
