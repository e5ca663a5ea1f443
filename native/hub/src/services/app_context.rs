// 应用上下文：显式携带路径与设置，替代全局可变单例
// 只有 GUI 边界层持有全局句柄

use std::sync::atomic::{AtomicBool, Ordering};

use crate::atoms::settings_store::SettingsStore;
use crate::services::path_service::PathService;

// 进程级退出标志，工作线程据此停止向界面回报
static EXITING: AtomicBool = AtomicBool::new(false);

pub fn mark_exiting() {
    EXITING.store(true, Ordering::SeqCst);
}

pub fn is_exiting() -> bool {
    EXITING.load(Ordering::SeqCst)
}

pub struct AppContext {
    pub paths: PathService,
    pub settings: SettingsStore,
}

impl AppContext {
    pub fn new(paths: PathService, settings: SettingsStore) -> Self {
        Self { paths, settings }
    }
}
