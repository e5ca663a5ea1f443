// 设置持久化后端
//
// 平台键值存储以 JSON 文件实现；测试使用内存后端

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub trait SettingsBackend: Send {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&mut self, key: &str, value: &str) -> Result<(), String>;
}

// 内存后端
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: BTreeMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsBackend for MemoryBackend {
    fn read(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn write(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// JSON 文件后端：每次写入立即落盘
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl JsonFileBackend {
    // 打开设置文件；文件不存在或损坏时从空设置开始
    pub fn open(path: &Path) -> Self {
        let values = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(values) => values,
                Err(e) => {
                    log::warn!("设置文件解析失败，使用默认设置：{}", e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                log::warn!("读取设置文件失败，使用默认设置：{}", e);
                BTreeMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            values,
        }
    }

    fn flush(&self) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("无法创建设置目录 {}：{}", parent.display(), e))?;
        }

        let content = serde_json::to_string_pretty(&self.values)
            .map_err(|e| format!("序列化设置失败：{}", e))?;

        // 先写临时文件再替换，避免写入中断导致设置损坏
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .map_err(|e| format!("写入设置文件失败：{}", e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| format!("替换设置文件失败：{}", e))
    }
}

impl SettingsBackend for JsonFileBackend {
    fn read(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn write(&mut self, key: &str, value: &str) -> Result<(), String> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }
}
