// Windows Job Object：关闭句柄时系统自动终止其中的子进程

use std::os::windows::io::AsRawHandle;
use std::process::Child;
use std::ptr;
use winapi::shared::minwindef::FALSE;
use winapi::um::handleapi::CloseHandle;
use winapi::um::jobapi2::{AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject};
use winapi::um::winnt::{
    HANDLE, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JobObjectExtendedLimitInformation,
};

pub struct JobObject(HANDLE);

// 句柄仅在持有者所在的锁内使用
unsafe impl Send for JobObject {}

impl JobObject {
    pub fn assign(child: &Child) -> Result<Self, String> {
        unsafe {
            let handle = CreateJobObjectW(ptr::null_mut(), ptr::null());
            if handle.is_null() {
                return Err("创建 Job Object 失败".to_string());
            }
            let job = JobObject(handle);

            let mut job_info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
            job_info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

            if SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                &mut job_info as *mut _ as *mut _,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            ) == FALSE
            {
                return Err("设置 Job Object 信息失败".to_string());
            }

            if AssignProcessToJobObject(job.0, child.as_raw_handle() as HANDLE) == FALSE {
                return Err("分配进程到 Job Object 失败".to_string());
            }

            Ok(job)
        }
    }
}

impl Drop for JobObject {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}
