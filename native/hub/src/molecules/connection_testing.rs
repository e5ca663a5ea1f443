// 连接测试分子模块：延迟（并发）与下载测速（串行队列）

pub mod ping_tester;
pub mod speed_tester;

pub use ping_tester::{
    DEFAULT_CONCURRENCY, PingJob, PingOutcome, PingResult, Pinger, SystemPinger, run_ping_batch,
};
pub use speed_tester::{SpeedJob, SpeedProgress, SpeedTester};
