// 开机自启动管理：由 StartupOnBoot 设置驱动，桌面平台使用 auto-launch。
// 不支持的平台记录日志后静默跳过。

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use auto_launch::{AutoLaunch, AutoLaunchBuilder};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use once_cell::sync::Lazy;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use std::sync::Mutex;

use crate::services::path_service::APP_NAME;

// 开机启动时附带的参数，界面据此最小化启动
pub const SILENT_START_ARG: &str = "--silent-start";

// 全局自启动配置实例
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
static AUTO_LAUNCH: Lazy<Mutex<Option<AutoLaunch>>> = Lazy::new(|| Mutex::new(None));

// 从可执行文件路径提取 macOS .app 包路径
pub fn app_bundle_path(binary_path: &str) -> Option<String> {
    binary_path
        .find(".app")
        .map(|pos| binary_path[..pos + 4].to_string())
}

// 获取缓存的可执行文件路径
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn get_cached_binary_path() -> Result<std::path::PathBuf, String> {
    static CACHED_BINARY_PATH: Lazy<Result<std::path::PathBuf, String>> = Lazy::new(|| {
        std::env::current_exe().map_err(|e| format!("无法获取当前可执行文件路径：{}", e))
    });
    CACHED_BINARY_PATH.clone()
}

// 初始化自启动配置
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn init_auto_launch() -> Result<(), String> {
    let mut instance = AUTO_LAUNCH
        .lock()
        .map_err(|e| format!("获取锁失败：{}", e))?;

    if instance.is_some() {
        return Ok(());
    }

    let binary_path = get_cached_binary_path()?.to_string_lossy().to_string();

    #[cfg(target_os = "macos")]
    let auto_launch = {
        let app_path = app_bundle_path(&binary_path)
            .ok_or_else(|| "无法从可执行文件路径解析 macOS .app 路径".to_string())?;

        AutoLaunchBuilder::new()
            .set_app_name(APP_NAME)
            .set_app_path(&app_path)
            .set_use_launch_agent(true)
            .set_args(&[SILENT_START_ARG])
            .build()
            .map_err(|e| format!("初始化自启动功能失败：{}", e))?
    };

    #[cfg(not(target_os = "macos"))]
    let auto_launch = AutoLaunchBuilder::new()
        .set_app_name(APP_NAME)
        .set_app_path(&binary_path)
        .set_args(&[SILENT_START_ARG])
        .build()
        .map_err(|e| format!("初始化自启动功能失败：{}", e))?;

    *instance = Some(auto_launch);
    Ok(())
}

// 查询当前自启动配置状态（读取系统配置）
pub fn get_auto_start_status() -> Result<bool, String> {
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    {
        init_auto_launch()?;

        let instance = AUTO_LAUNCH
            .lock()
            .map_err(|e| format!("获取锁失败：{}", e))?;

        match &*instance {
            Some(auto_launch) => auto_launch
                .is_enabled()
                .map_err(|e| format!("获取自启动状态失败：{}", e)),
            None => Err("自启动模块未初始化".to_string()),
        }
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Ok(false)
    }
}

// 在系统中注册或移除开机自启，返回设置后的实际状态
pub fn set_auto_start_status(enabled: bool) -> Result<bool, String> {
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    {
        init_auto_launch()?;

        let instance = AUTO_LAUNCH
            .lock()
            .map_err(|e| format!("获取锁失败：{}", e))?;

        match &*instance {
            Some(auto_launch) => {
                if enabled {
                    auto_launch
                        .enable()
                        .map_err(|e| format!("启用开机自启失败：{}", e))?;
                } else {
                    auto_launch
                        .disable()
                        .map_err(|e| format!("禁用开机自启失败：{}", e))?;
                }

                let status = auto_launch
                    .is_enabled()
                    .map_err(|e| format!("获取自启动状态失败：{}", e))?;

                log::debug!("已设置开机自启状态为：{}", status);
                Ok(status)
            }
            None => Err("自启动模块未初始化".to_string()),
        }
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        log::debug!("当前平台不支持开机自启动（期望：{}）", enabled);
        Ok(false)
    }
}

// 让系统状态与 StartupOnBoot 设置一致；失败只记录日志
pub fn sync_with_setting(enabled: bool) {
    match get_auto_start_status() {
        Ok(current) if current == enabled => {
            log::debug!("开机自启状态已是 {}", enabled);
        }
        Ok(_) => {
            if let Err(e) = set_auto_start_status(enabled) {
                log::warn!("同步开机自启状态失败：{}", e);
            }
        }
        Err(e) => log::warn!("无法读取开机自启状态，跳过同步：{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_bundle_path() {
        assert_eq!(
            app_bundle_path("/Applications/Skylark.app/Contents/MacOS/skylark"),
            Some("/Applications/Skylark.app".to_string())
        );
        assert_eq!(app_bundle_path("/usr/bin/skylark"), None);
    }
}
