// 应用文件路径管理服务，单例模式
// 负责管理安装目录、核心程序、资源文件与日志路径，避免路径逻辑分散

use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const APP_NAME: &str = "Skylark";

// 路径服务单例
pub static PATH_SERVICE: Lazy<RwLock<PathService>> = Lazy::new(|| {
    let service = PathService::new().unwrap_or_else(|e| {
        eprintln!("[PathService] 初始化失败：{}，使用降级路径", e);
        PathService::fallback()
    });
    RwLock::new(service)
});

// 路径服务结构
#[derive(Debug, Clone)]
pub struct PathService {
    // 安装根目录（可执行文件所在目录）
    install_root: PathBuf,

    // 应用数据根目录（启动配置、ACL 等运行时文件）
    app_data_dir: PathBuf,

    // 外部代理核心目录（xray / hysteria / tun2socks）
    cores_dir: PathBuf,

    // 随应用打包的资源目录（geosite、geoip、acl、mmdb）
    assets_dir: PathBuf,

    // 核心日志目录
    logs_dir: PathBuf,

    // 崩溃日志目录
    crash_dir: PathBuf,

    // 用户设置文件
    settings_file: PathBuf,
}

impl PathService {
    // 创建路径服务实例
    pub fn new() -> Result<Self, String> {
        let current_exe =
            std::env::current_exe().map_err(|e| format!("无法获取当前可执行文件路径：{}", e))?;

        let install_root = current_exe
            .parent()
            .ok_or_else(|| "无法获取可执行文件所在目录".to_string())?
            .to_path_buf();

        let mut service = Self::with_root(&install_root);

        // 用户设置优先放在系统配置目录，便于升级安装目录后保留
        if let Some(config_dir) = dirs::config_dir() {
            service.settings_file = config_dir.join(APP_NAME).join("settings.json");
        }

        Ok(service)
    }

    // 以指定目录为安装根目录构建全部路径
    pub fn with_root(install_root: &Path) -> Self {
        let app_data_dir = install_root.join("data");

        Self {
            install_root: install_root.to_path_buf(),
            cores_dir: install_root.join("cores"),
            assets_dir: install_root.join("assets"),
            logs_dir: install_root.join("logs"),
            crash_dir: install_root.join("crash"),
            settings_file: app_data_dir.join("settings.json"),
            app_data_dir,
        }
    }

    // 降级路径（初始化失败时使用）
    fn fallback() -> Self {
        let current_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_root(&current_dir)
    }

    pub fn install_root(&self) -> &PathBuf {
        &self.install_root
    }

    pub fn app_data_dir(&self) -> &PathBuf {
        &self.app_data_dir
    }

    pub fn cores_dir(&self) -> &PathBuf {
        &self.cores_dir
    }

    pub fn assets_dir(&self) -> &PathBuf {
        &self.assets_dir
    }

    pub fn logs_dir(&self) -> &PathBuf {
        &self.logs_dir
    }

    pub fn crash_dir(&self) -> &PathBuf {
        &self.crash_dir
    }

    pub fn settings_file(&self) -> &PathBuf {
        &self.settings_file
    }

    // 获取核心可执行文件路径（Windows 自动补全 .exe）
    pub fn core_binary(&self, name: &str) -> PathBuf {
        #[cfg(target_os = "windows")]
        let file_name = format!("{}.exe", name);
        #[cfg(not(target_os = "windows"))]
        let file_name = name.to_string();

        self.cores_dir.join(file_name)
    }

    // 确保所有必要的目录存在
    pub fn ensure_dirs(&self) -> Result<(), String> {
        let mut dirs = vec![&self.app_data_dir, &self.logs_dir, &self.crash_dir];
        let settings_parent = self.settings_file.parent().map(Path::to_path_buf);
        if let Some(ref parent) = settings_parent {
            dirs.push(parent);
        }

        for dir in dirs {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| format!("无法创建目录 {}：{}", dir.display(), e))?;
                log::debug!("已创建目录：{}", dir.display());
            }
        }

        Ok(())
    }
}

// 获取当前路径服务快照，供显式上下文传递
pub fn snapshot() -> PathService {
    PATH_SERVICE
        .read()
        .map(|s| s.clone())
        .unwrap_or_else(|_| PathService::fallback())
}

// 获取崩溃日志目录
pub fn crash_dir() -> PathBuf {
    PATH_SERVICE
        .read()
        .map(|s| s.crash_dir().clone())
        .unwrap_or_else(|_| PathBuf::from("crash"))
}

// 初始化路径服务（预加载单例，创建必要目录）
pub fn init() {
    Lazy::force(&PATH_SERVICE);

    let result = PATH_SERVICE
        .read()
        .map_err(|e| format!("无法获取路径服务锁：{}", e))
        .and_then(|s| s.ensure_dirs());

    if let Err(e) = result {
        log::error!("创建必要目录失败：{}", e);
    }

    log::debug!("PathService 已初始化");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_rooted_at_install_dir() {
        let service = PathService::with_root(Path::new("/opt/skylark"));

        assert_eq!(service.assets_dir(), &PathBuf::from("/opt/skylark/assets"));
        assert_eq!(service.logs_dir(), &PathBuf::from("/opt/skylark/logs"));
        assert!(service.core_binary("xray").starts_with("/opt/skylark/cores"));
    }
}
