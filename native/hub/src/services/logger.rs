// 日志初始化
//
// 桌面平台使用 env_logger（带时间戳），Android 使用 android_logger

// 初始化全局日志，可通过 RUST_LOG 覆盖默认级别
pub fn init_logger() {
    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(log::LevelFilter::Info)
                .with_tag("skylark"),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        use std::io::Write;

        let result = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

        // 重复初始化（例如测试中）直接忽略
        if result.is_err() {
            log::debug!("日志系统已初始化，跳过");
        }
    }
}
