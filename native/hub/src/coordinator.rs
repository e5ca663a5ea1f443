// L2 协调层模块入口

pub mod app_core;
pub mod proxy_coordinator;

pub use app_core::{AppCommand, AppCore, AppEvent, ConnectError, Notice, NoticeSink};

pub fn init_all() {
    proxy_coordinator::init();
    log::info!("协调层初始化完成");
}

pub async fn cleanup() {
    log::info!("清理协调层资源");
    proxy_coordinator::cleanup().await;
}
