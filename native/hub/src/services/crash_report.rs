// 宿主程序退出码与崩溃日志

use std::path::{Path, PathBuf};

// 宿主程序退出码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExitCode {
    Clean = 0,
    PlatformNotSupported = 1,
    AssertionError = 2,
    UnknownException = 3,
}

impl HostExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

// 当前平台是否受支持（桌面三平台）
pub fn is_platform_supported() -> bool {
    cfg!(any(target_os = "windows", target_os = "linux", target_os = "macos"))
}

// 生成带时间戳的崩溃日志文件名
pub fn crash_log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("Crash-{}.log", now.format("%Y-%m-%d-%H-%M-%S"))
}

// 将崩溃信息写入安装目录下的崩溃日志
pub fn write_crash_log(dir: &Path, exit_code: HostExitCode, detail: &str) -> Result<PathBuf, String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("无法创建崩溃日志目录 {}：{}", dir.display(), e))?;

    let path = dir.join(crash_log_file_name(chrono::Local::now()));
    let content = format!(
        "version: {}\nplatform: {}-{}\nexit code: {:?} ({})\n\n{}\n",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        exit_code,
        exit_code.code(),
        detail
    );

    std::fs::write(&path, content)
        .map_err(|e| format!("无法写入崩溃日志 {}：{}", path.display(), e))?;

    Ok(path)
}

// 安装 panic 钩子：记录崩溃日志后交还默认处理
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "未知错误".to_string());

        let exit_code = if payload.contains("assertion") {
            HostExitCode::AssertionError
        } else {
            HostExitCode::UnknownException
        };

        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let detail = format!("{}\nat {}", payload, location);

        match write_crash_log(&super::path_service::crash_dir(), exit_code, &detail) {
            Ok(path) => log::error!("程序崩溃，日志已写入：{}", path.display()),
            Err(e) => log::error!("程序崩溃且无法写入崩溃日志：{}", e),
        }

        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_crash_log_name_is_timestamped() {
        let Some(now) = chrono::Local
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
        else {
            return;
        };

        assert_eq!(crash_log_file_name(now), "Crash-2024-03-09-07-05-01.log");
    }

    #[test]
    fn test_write_crash_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_crash_log(dir.path(), HostExitCode::AssertionError, "boom").unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("AssertionError (2)"));
        assert!(content.contains("boom"));
    }
}
