// 系统代理平台实现：Windows 使用 WinInet 按连接设置，
// macOS 使用 networksetup，Linux 支持 GNOME (gsettings) 和 KDE (kwriteconfig5)。

// 期望的系统代理设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySetting {
    // host:port 与分号分隔的绕过列表
    Server { server: String, bypass: String },
    // 自动配置脚本地址
    Pac { url: String },
}

// 系统代理当前状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyInfo {
    pub is_enabled: bool,
    pub is_pac: bool,
    pub server: Option<String>,
}

impl ProxyInfo {
    // 当前状态是否已满足期望设置
    pub fn satisfies(&self, setting: &ProxySetting) -> bool {
        match setting {
            ProxySetting::Server { server, .. } => {
                self.is_enabled && self.server.as_deref() == Some(server.as_str())
            }
            ProxySetting::Pac { .. } => self.is_pac,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("系统代理辅助程序不可用：{0}")]
    HelperMissing(String),
    #[error("{0}")]
    Failed(String),
}

// 平台代理操作接口，守护线程与控制器共用
pub trait ProxyPlatform: Send + Sync + 'static {
    fn apply(&self, setting: &ProxySetting) -> Result<(), PlatformError>;
    fn clear(&self) -> Result<(), PlatformError>;
    fn query(&self) -> ProxyInfo;
}

// 当前操作系统的代理实现
#[derive(Debug, Default)]
pub struct OsProxyPlatform;

impl ProxyPlatform for OsProxyPlatform {
    fn apply(&self, setting: &ProxySetting) -> Result<(), PlatformError> {
        match setting {
            ProxySetting::Server { server, bypass } => os::enable_proxy(server, bypass),
            ProxySetting::Pac { url } => os::enable_pac(url),
        }
    }

    fn clear(&self) -> Result<(), PlatformError> {
        os::disable_proxy()
    }

    fn query(&self) -> ProxyInfo {
        os::get_proxy_info()
    }
}

fn split_bypass(bypass: &str) -> Vec<&str> {
    bypass
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run(program: &str, args: &[&str]) -> Result<(), PlatformError> {
    use std::process::Command;

    match Command::new(program).args(args).status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(PlatformError::Failed(format!(
            "{} {} 失败，退出码：{:?}",
            program,
            args.first().copied().unwrap_or_default(),
            status.code()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PlatformError::HelperMissing(program.to_string()))
        }
        Err(e) => Err(PlatformError::Failed(format!("执行 {} 失败：{}", program, e))),
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn output(program: &str, args: &[&str]) -> Option<String> {
    std::process::Command::new(program)
        .args(args)
        .output()
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

#[cfg(target_os = "windows")]
mod os {
    use super::{PlatformError, ProxyInfo, split_bypass};
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::NetworkManagement::Rras::{RASENTRYNAMEW, RasEnumEntriesW};
    use windows::Win32::Networking::WinInet::{
        INTERNET_OPTION_PER_CONNECTION_OPTION, INTERNET_OPTION_REFRESH,
        INTERNET_OPTION_SETTINGS_CHANGED, INTERNET_PER_CONN_AUTOCONFIG_URL,
        INTERNET_PER_CONN_FLAGS, INTERNET_PER_CONN_OPTION_LISTW, INTERNET_PER_CONN_OPTIONW,
        INTERNET_PER_CONN_PROXY_BYPASS, INTERNET_PER_CONN_PROXY_SERVER, InternetQueryOptionW,
        InternetSetOptionW, PROXY_TYPE_AUTO_PROXY_URL, PROXY_TYPE_DIRECT, PROXY_TYPE_PROXY,
    };
    use windows::core::PWSTR;

    fn wide(text: &str) -> Vec<u16> {
        OsStr::new(text)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    // 构造单个按连接选项
    unsafe fn flag_option(flags: u32) -> INTERNET_PER_CONN_OPTIONW {
        unsafe {
            let mut option = INTERNET_PER_CONN_OPTIONW {
                dwOption: INTERNET_PER_CONN_FLAGS,
                Value: std::mem::zeroed(),
            };
            *(&mut option.Value as *mut _ as *mut u32) = flags;
            option
        }
    }

    unsafe fn empty_option() -> INTERNET_PER_CONN_OPTIONW {
        unsafe {
            INTERNET_PER_CONN_OPTIONW {
                dwOption: INTERNET_PER_CONN_FLAGS,
                Value: std::mem::zeroed(),
            }
        }
    }

    // 以宽字符串填充选项值，调用方保证缓冲区存活到选项写入完成
    unsafe fn string_value(option: &mut INTERNET_PER_CONN_OPTIONW, value: &mut [u16]) {
        unsafe {
            *(&mut option.Value as *mut _ as *mut PWSTR) = PWSTR(value.as_mut_ptr());
        }
    }

    // 写入默认连接与全部 RAS 连接，并通知系统刷新
    fn apply_options(options: &mut [INTERNET_PER_CONN_OPTIONW], action: &str) -> Result<(), PlatformError> {
        unsafe {
            let mut list = INTERNET_PER_CONN_OPTION_LISTW {
                dwSize: std::mem::size_of::<INTERNET_PER_CONN_OPTION_LISTW>() as u32,
                pszConnection: PWSTR::null(),
                dwOptionCount: options.len() as u32,
                dwOptionError: 0,
                pOptions: options.as_mut_ptr(),
            };

            InternetSetOptionW(
                None,
                INTERNET_OPTION_PER_CONNECTION_OPTION,
                Some(&list as *const _ as *const _),
                std::mem::size_of::<INTERNET_PER_CONN_OPTION_LISTW>() as u32,
            )
            .map_err(|e| PlatformError::Failed(format!("{}失败：{}", action, e)))?;

            set_ras_proxy(&mut list);

            let _ = InternetSetOptionW(None, INTERNET_OPTION_SETTINGS_CHANGED, None, 0);
            let _ = InternetSetOptionW(None, INTERNET_OPTION_REFRESH, None, 0);
        }

        Ok(())
    }

    pub fn enable_proxy(server: &str, bypass: &str) -> Result<(), PlatformError> {
        log::info!("正在设置系统代理：{}", server);

        let mut server_wide = wide(server);
        let mut bypass_wide = wide(&split_bypass(bypass).join(";"));

        let mut options = unsafe {
            let mut server_option = empty_option();
            server_option.dwOption = INTERNET_PER_CONN_PROXY_SERVER;
            string_value(&mut server_option, &mut server_wide);

            let mut bypass_option = empty_option();
            bypass_option.dwOption = INTERNET_PER_CONN_PROXY_BYPASS;
            string_value(&mut bypass_option, &mut bypass_wide);

            [
                flag_option(PROXY_TYPE_DIRECT | PROXY_TYPE_PROXY),
                server_option,
                bypass_option,
            ]
        };

        apply_options(&mut options, "设置系统代理")?;
        log::info!("系统代理设置成功：{}", server);
        Ok(())
    }

    pub fn enable_pac(url: &str) -> Result<(), PlatformError> {
        log::info!("正在设置系统代理 (PAC 模式)：{}", url);

        let mut url_wide = wide(url);
        let mut options = unsafe {
            let mut url_option = empty_option();
            url_option.dwOption = INTERNET_PER_CONN_AUTOCONFIG_URL;
            string_value(&mut url_option, &mut url_wide);

            [
                flag_option(PROXY_TYPE_AUTO_PROXY_URL | PROXY_TYPE_DIRECT),
                url_option,
            ]
        };

        apply_options(&mut options, "设置 PAC 代理")
    }

    pub fn disable_proxy() -> Result<(), PlatformError> {
        log::info!("正在禁用系统代理");

        let mut options = unsafe { [flag_option(PROXY_TYPE_DIRECT)] };
        apply_options(&mut options, "禁用系统代理")?;

        log::info!("系统代理已禁用");
        Ok(())
    }

    // 同步 RAS 拨号连接的代理配置
    fn set_ras_proxy(list: &mut INTERNET_PER_CONN_OPTION_LISTW) {
        unsafe {
            let mut entry = RASENTRYNAMEW {
                dwSize: std::mem::size_of::<RASENTRYNAMEW>() as u32,
                ..Default::default()
            };

            let mut size = std::mem::size_of::<RASENTRYNAMEW>() as u32;
            let mut count = 0u32;

            // 第一次调用获取需要的缓冲区大小
            let result = RasEnumEntriesW(None, None, Some(&mut entry), &mut size, &mut count);

            if result != ERROR_SUCCESS.0 && count > 0 {
                let mut entries = vec![
                    RASENTRYNAMEW {
                        dwSize: std::mem::size_of::<RASENTRYNAMEW>() as u32,
                        ..Default::default()
                    };
                    count as usize
                ];

                let result = RasEnumEntriesW(
                    None,
                    None,
                    Some(entries.as_mut_ptr()),
                    &mut size,
                    &mut count,
                );

                if result == ERROR_SUCCESS.0 {
                    for entry in &mut entries {
                        list.pszConnection = PWSTR(entry.szEntryName.as_mut_ptr());
                        let _ = InternetSetOptionW(
                            None,
                            INTERNET_OPTION_PER_CONNECTION_OPTION,
                            Some(list as *const _ as *const _),
                            std::mem::size_of::<INTERNET_PER_CONN_OPTION_LISTW>() as u32,
                        );
                    }
                }
            }
        }
    }

    pub fn get_proxy_info() -> ProxyInfo {
        unsafe {
            let option_flags = INTERNET_PER_CONN_OPTIONW {
                dwOption: INTERNET_PER_CONN_FLAGS,
                Value: std::mem::zeroed(),
            };
            let option_server = INTERNET_PER_CONN_OPTIONW {
                dwOption: INTERNET_PER_CONN_PROXY_SERVER,
                Value: std::mem::zeroed(),
            };

            let mut options = [option_flags, option_server];

            let mut list = INTERNET_PER_CONN_OPTION_LISTW {
                dwSize: std::mem::size_of::<INTERNET_PER_CONN_OPTION_LISTW>() as u32,
                pszConnection: PWSTR::null(),
                dwOptionCount: options.len() as u32,
                dwOptionError: 0,
                pOptions: options.as_mut_ptr(),
            };

            let mut size = std::mem::size_of::<INTERNET_PER_CONN_OPTION_LISTW>() as u32;

            if InternetQueryOptionW(
                None,
                INTERNET_OPTION_PER_CONNECTION_OPTION,
                Some(&mut list as *mut _ as *mut _),
                &mut size,
            )
            .is_err()
            {
                log::warn!("查询系统代理设置失败");
                return ProxyInfo::default();
            }

            let flags = *(&options[0].Value as *const _ as *const u32);
            let is_enabled = (flags & PROXY_TYPE_PROXY) != 0;
            let is_pac = (flags & PROXY_TYPE_AUTO_PROXY_URL) != 0;

            let server_ptr = *(&options[1].Value as *const _ as *const PWSTR);
            let server = if is_enabled && !server_ptr.is_null() {
                server_ptr.to_string().ok()
            } else {
                None
            };

            ProxyInfo {
                is_enabled,
                is_pac,
                server,
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod os {
    use super::{PlatformError, ProxyInfo, output, run, split_bypass};

    const NETWORKSETUP: &str = "/usr/sbin/networksetup";

    // 获取全部网络服务（带 * 的为已停用服务）
    fn network_services() -> Result<Vec<String>, PlatformError> {
        let stdout = match std::process::Command::new(NETWORKSETUP)
            .arg("-listallnetworkservices")
            .output()
        {
            Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout).to_string(),
            Ok(_) => return Err(PlatformError::Failed("获取网络服务列表失败".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PlatformError::HelperMissing(NETWORKSETUP.to_string()));
            }
            Err(e) => return Err(PlatformError::Failed(format!("执行 networksetup 失败：{}", e))),
        };

        // 首行为说明文字
        Ok(stdout
            .lines()
            .skip(1)
            .filter(|line| !line.is_empty() && !line.contains('*'))
            .map(str::to_string)
            .collect())
    }

    pub fn enable_proxy(server: &str, bypass: &str) -> Result<(), PlatformError> {
        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| PlatformError::Failed(format!("代理地址格式错误：{}", server)))?;

        let services = network_services()?;
        log::info!("正在为 {} 个网络服务设置代理：{}", services.len(), server);

        for service in &services {
            run(NETWORKSETUP, &["-setwebproxy", service, host, port])?;
            run(NETWORKSETUP, &["-setsecurewebproxy", service, host, port])?;

            let mut args = vec!["-setproxybypassdomains", service.as_str()];
            let domains = split_bypass(bypass);
            if domains.is_empty() {
                args.push("Empty");
            } else {
                args.extend(domains);
            }
            run(NETWORKSETUP, &args)?;
        }

        log::info!("macOS 系统代理设置成功");
        Ok(())
    }

    pub fn enable_pac(url: &str) -> Result<(), PlatformError> {
        for service in &network_services()? {
            run(NETWORKSETUP, &["-setautoproxyurl", service, url])?;
            run(NETWORKSETUP, &["-setautoproxystate", service, "on"])?;
        }
        Ok(())
    }

    pub fn disable_proxy() -> Result<(), PlatformError> {
        for service in &network_services()? {
            run(NETWORKSETUP, &["-setautoproxystate", service, "off"])?;
            run(NETWORKSETUP, &["-setwebproxystate", service, "off"])?;
            run(NETWORKSETUP, &["-setsecurewebproxystate", service, "off"])?;
        }

        log::info!("macOS 系统代理已禁用");
        Ok(())
    }

    pub fn get_proxy_info() -> ProxyInfo {
        let Ok(services) = network_services() else {
            return ProxyInfo::default();
        };

        for service in &services {
            let Some(stdout) = output(NETWORKSETUP, &["-getwebproxy", service]) else {
                continue;
            };

            let mut enabled = false;
            let mut host = String::new();
            let mut port = String::new();

            for line in stdout.lines() {
                if let Some(v) = line.strip_prefix("Enabled:") {
                    enabled = v.trim() == "Yes";
                } else if let Some(v) = line.strip_prefix("Server:") {
                    host = v.trim().to_string();
                } else if let Some(v) = line.strip_prefix("Port:") {
                    port = v.trim().to_string();
                }
            }

            if enabled && !host.is_empty() {
                return ProxyInfo {
                    is_enabled: true,
                    is_pac: false,
                    server: Some(format!("{}:{}", host, port)),
                };
            }
        }

        ProxyInfo::default()
    }
}

#[cfg(target_os = "linux")]
mod os {
    use super::{PlatformError, ProxyInfo, output, run, split_bypass};

    const GSETTINGS: &str = "gsettings";
    const KWRITECONFIG: &str = "kwriteconfig5";
    const KREADCONFIG: &str = "kreadconfig5";
    const KDE_GROUP: &str = "Proxy Settings";

    fn is_kde() -> bool {
        std::env::var("XDG_CURRENT_DESKTOP")
            .unwrap_or_default()
            .to_uppercase()
            .contains("KDE")
    }

    fn kde_config_file() -> Result<String, PlatformError> {
        dirs::config_dir()
            .map(|d| d.join("kioslaverc").display().to_string())
            .ok_or_else(|| PlatformError::Failed("无法获取用户配置目录".to_string()))
    }

    fn kde_write(key: &str, value: &str) -> Result<(), PlatformError> {
        let file = kde_config_file()?;
        run(
            KWRITECONFIG,
            &["--file", &file, "--group", KDE_GROUP, "--key", key, value],
        )
    }

    fn kde_read(key: &str) -> Option<String> {
        let file = kde_config_file().ok()?;
        output(
            KREADCONFIG,
            &["--file", &file, "--group", KDE_GROUP, "--key", key],
        )
    }

    pub fn enable_proxy(server: &str, bypass: &str) -> Result<(), PlatformError> {
        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| PlatformError::Failed(format!("代理地址格式错误：{}", server)))?;
        let domains = split_bypass(bypass);

        log::info!("正在设置 Linux 系统代理：{}", server);

        if is_kde() {
            // 1 = 手动代理
            kde_write("ProxyType", "1")?;
            kde_write("NoProxyFor", &domains.join(","))?;
            for scheme in ["http", "https"] {
                kde_write(
                    &format!("{}Proxy", scheme),
                    &format!("http://{} {}", host, port),
                )?;
            }
        } else {
            run(GSETTINGS, &["set", "org.gnome.system.proxy", "mode", "manual"])?;

            let ignore_hosts = format!("['{}']", domains.join("', '"));
            run(
                GSETTINGS,
                &["set", "org.gnome.system.proxy", "ignore-hosts", &ignore_hosts],
            )?;

            for scheme in ["http", "https"] {
                let schema = format!("org.gnome.system.proxy.{}", scheme);
                run(GSETTINGS, &["set", &schema, "host", host])?;
                run(GSETTINGS, &["set", &schema, "port", port])?;
            }
        }

        log::info!("Linux 系统代理设置成功");
        Ok(())
    }

    pub fn enable_pac(url: &str) -> Result<(), PlatformError> {
        if is_kde() {
            // 2 = 自动配置脚本
            kde_write("ProxyType", "2")?;
            kde_write("Proxy Config Script", url)
        } else {
            run(GSETTINGS, &["set", "org.gnome.system.proxy", "mode", "auto"])?;
            run(
                GSETTINGS,
                &["set", "org.gnome.system.proxy", "autoconfig-url", url],
            )
        }
    }

    pub fn disable_proxy() -> Result<(), PlatformError> {
        if is_kde() {
            kde_write("ProxyType", "0")?;
        } else {
            run(GSETTINGS, &["set", "org.gnome.system.proxy", "mode", "none"])?;
        }

        log::info!("Linux 系统代理已禁用");
        Ok(())
    }

    pub fn get_proxy_info() -> ProxyInfo {
        if is_kde() {
            let proxy_type = kde_read("ProxyType").unwrap_or_default();
            let server = kde_read("httpProxy")
                .map(|p| p.trim_start_matches("http://").replace(' ', ":"))
                .filter(|p| !p.is_empty());

            return ProxyInfo {
                is_enabled: proxy_type == "1",
                is_pac: proxy_type == "2",
                server,
            };
        }

        let mode = output(GSETTINGS, &["get", "org.gnome.system.proxy", "mode"]).unwrap_or_default();
        if mode.contains("auto") {
            return ProxyInfo {
                is_enabled: false,
                is_pac: true,
                server: None,
            };
        }
        if !mode.contains("manual") {
            return ProxyInfo::default();
        }

        let host = output(GSETTINGS, &["get", "org.gnome.system.proxy.http", "host"])
            .unwrap_or_default()
            .trim_matches('\'')
            .to_string();
        let port = output(GSETTINGS, &["get", "org.gnome.system.proxy.http", "port"])
            .unwrap_or_default();

        ProxyInfo {
            is_enabled: !host.is_empty(),
            is_pac: false,
            server: (!host.is_empty()).then(|| format!("{}:{}", host, port)),
        }
    }
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
mod os {
    use super::{PlatformError, ProxyInfo};

    const UNSUPPORTED: &str = "当前平台不支持系统代理设置";

    pub fn enable_proxy(_server: &str, _bypass: &str) -> Result<(), PlatformError> {
        Err(PlatformError::HelperMissing(UNSUPPORTED.to_string()))
    }

    pub fn enable_pac(_url: &str) -> Result<(), PlatformError> {
        Err(PlatformError::HelperMissing(UNSUPPORTED.to_string()))
    }

    pub fn disable_proxy() -> Result<(), PlatformError> {
        Err(PlatformError::HelperMissing(UNSUPPORTED.to_string()))
    }

    pub fn get_proxy_info() -> ProxyInfo {
        ProxyInfo::default()
    }
}
