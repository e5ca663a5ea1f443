// 管理员权限检测（VPN 模式需要）

#[cfg(target_os = "windows")]
pub fn is_admin() -> bool {
    use windows::Win32::UI::Shell::IsUserAnAdmin;
    unsafe { IsUserAnAdmin().as_bool() }
}

#[cfg(unix)]
pub fn is_admin() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(any(target_os = "windows", unix)))]
pub fn is_admin() -> bool {
    false
}
