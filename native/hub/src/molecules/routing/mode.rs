use std::fmt;

use crate::atoms::settings_store::store::ROUTING_MODES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    #[default]
    BypassMainlandChina,
    BypassIran,
    Global,
    Custom,
}

impl RoutingMode {
    pub const ALL: [RoutingMode; 4] = [
        RoutingMode::BypassMainlandChina,
        RoutingMode::BypassIran,
        RoutingMode::Global,
        RoutingMode::Custom,
    ];

    // 与设置项 Routing 的取值一致
    pub fn name(self) -> &'static str {
        match self {
            RoutingMode::BypassMainlandChina => ROUTING_MODES[0],
            RoutingMode::BypassIran => ROUTING_MODES[1],
            RoutingMode::Global => ROUTING_MODES[2],
            RoutingMode::Custom => ROUTING_MODES[3],
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.name() == name)
    }

    // 打包规则文件名
    pub fn file_stem(self) -> &'static str {
        match self {
            RoutingMode::BypassMainlandChina => "bypass-mainland-china",
            RoutingMode::BypassIran => "bypass-iran",
            RoutingMode::Global => "global",
            RoutingMode::Custom => "custom",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
