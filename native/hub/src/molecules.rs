// L1 分子层模块入口：组合原子能力的业务单元

pub mod connection_testing;
pub mod core_manager;
pub mod core_process;
pub mod routing;
pub mod server_registry;
pub mod subscription_management;
pub mod system_operations;

pub use core_manager::CoreManager;
pub use core_process::{CoreKind, CoreSupervisor};
pub use routing::RoutingMode;
pub use server_registry::ServerRegistry;
pub use subscription_management::SubscriptionFetcher;
