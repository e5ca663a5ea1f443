// 路由分子模块：路由模式与启动前的配置改写

pub mod materializer;
pub mod mode;

pub use materializer::{
    HysteriaRules, apply_hysteria1_rules, hysteria1_rules, materialize_xray, routing_object,
};
pub use mode::RoutingMode;
