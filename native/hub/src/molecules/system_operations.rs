// 系统操作分子模块

pub mod auto_start;

pub use auto_start::{get_auto_start_status, set_auto_start_status, sync_with_setting};
