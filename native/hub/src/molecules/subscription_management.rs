// 订阅管理分子模块

pub mod downloader;

pub use downloader::{
    SubscriptionEvent, SubscriptionFetcher, SubscriptionInfo, download_subscription,
    parse_subscription_body,
};
