// 基础服务层模块入口

pub mod app_context;
pub mod crash_report;
pub mod logger;
pub mod path_service;

pub use app_context::{AppContext, is_exiting, mark_exiting};
pub use path_service::PathService;
