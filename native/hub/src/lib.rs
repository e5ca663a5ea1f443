// Rust 端入口：日志、路径与崩溃钩子就绪后启动协调层，
// 等待 Dart 端关闭后停止全部核心并撤销系统代理。

pub mod atoms;
pub mod coordinator;
pub mod molecules;
pub mod services;

use rinf::{dart_shutdown, write_interface};

use services::crash_report::{self, HostExitCode};
use services::{logger, path_service};

write_interface!();

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logger::init_logger();
    path_service::init();
    crash_report::install_panic_hook();

    if !crash_report::is_platform_supported() {
        let exit_code = HostExitCode::PlatformNotSupported;
        log::error!("当前平台不受支持：{}", std::env::consts::OS);
        if let Err(e) = crash_report::write_crash_log(
            &path_service::crash_dir(),
            exit_code,
            "platform not supported",
        ) {
            log::error!("{}", e);
        }
        std::process::exit(exit_code.code());
    }

    log::info!("{} 启动，版本 {}", path_service::APP_NAME, env!("CARGO_PKG_VERSION"));
    coordinator::init_all();

    dart_shutdown().await;

    services::mark_exiting();
    coordinator::cleanup().await;
    log::info!("已正常退出");
}
