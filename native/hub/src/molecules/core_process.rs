// 核心进程分子模块：每个外部核心运行在独立子进程中

pub mod core_kind;
#[cfg(target_os = "windows")]
mod job_object;
pub mod supervisor;

pub use core_kind::{CoreKind, ExitReason};
pub use supervisor::{
    CoreSupervisor, DEFAULT_WAIT_TIME, ExitCallback, MessageCallback, StartOptions,
    SupervisorState,
};
