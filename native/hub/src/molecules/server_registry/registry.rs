// 服务器列表与订阅映射
//
// 所有变更都在主循环上串行执行；后台任务通过 FactoryId 回写结果，
// 目标已删除或已被替换时放弃写入。

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::atoms::{ConfigFactory, FactoryId};

const SUBSCRIPTION_ID_LENGTH: usize = 32;

// 订阅描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub remark: String,
    #[serde(rename = "webURL")]
    pub web_url: String,
}

// 删除结果
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    // 被移除的配置（已标记删除）
    pub removed: Vec<ConfigFactory>,
    // 激活项被删除：激活已清除，需要断开连接
    pub disconnect_requested: bool,
}

// 可排序的列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortColumn {
    Remark,
    Protocol,
    Address,
    Port,
    Transport,
    Tls,
    Subscription,
    Latency,
    Speed,
}

#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Number(f64),
    Text(String),
    // 无结果或不可解析的值排在最后
    Missing,
}

impl SortKey {
    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (SortKey::Text(a), SortKey::Text(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
            (SortKey::Missing, SortKey::Missing) => Ordering::Equal,
            (SortKey::Missing, _) => Ordering::Greater,
            (_, SortKey::Missing) => Ordering::Less,
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
        }
    }
}

// 取开头的数值部分，如 "123ms"、"1.50 M/s"
fn leading_number(text: &str) -> SortKey {
    let number: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    number
        .parse::<f64>()
        .map(SortKey::Number)
        .unwrap_or(SortKey::Missing)
}

// 随机生成不与现有订阅冲突的标识
pub(super) fn new_subscription_id(existing: &BTreeMap<String, Subscription>) -> String {
    loop {
        let candidate: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(SUBSCRIPTION_ID_LENGTH)
            .map(char::from)
            .collect();
        if !existing.contains_key(&candidate) {
            return candidate;
        }
    }
}

#[derive(Debug)]
pub struct ServerRegistry {
    factories: Vec<ConfigFactory>,
    subscriptions: BTreeMap<String, Subscription>,
    activated: i64,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            subscriptions: BTreeMap::new(),
            activated: -1,
        }
    }

    pub(super) fn from_parts(
        factories: Vec<ConfigFactory>,
        subscriptions: BTreeMap<String, Subscription>,
        activated: i64,
    ) -> Self {
        let mut registry = Self {
            factories,
            subscriptions,
            activated: -1,
        };
        registry.activate(activated, true);
        registry
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ConfigFactory> {
        self.factories.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ConfigFactory> {
        self.factories.get_mut(index)
    }

    pub fn factories(&self) -> &[ConfigFactory] {
        &self.factories
    }

    pub fn subscriptions(&self) -> &BTreeMap<String, Subscription> {
        &self.subscriptions
    }

    pub fn activated_index(&self) -> i64 {
        self.activated
    }

    pub fn activated(&self) -> Option<&ConfigFactory> {
        usize::try_from(self.activated)
            .ok()
            .and_then(|i| self.factories.get(i))
    }

    pub fn find_by_id(&self, id: FactoryId) -> Option<usize> {
        self.factories.iter().position(|f| f.id() == id)
    }

    pub fn append(&mut self, factory: ConfigFactory) -> usize {
        self.factories.push(factory);
        self.factories.len() - 1
    }

    // 删除指定行；越界与重复的下标被忽略
    pub fn delete_by_index(&mut self, indices: &[usize]) -> DeleteOutcome {
        let targets: BTreeSet<usize> = indices
            .iter()
            .copied()
            .filter(|i| *i < self.factories.len())
            .collect();

        if targets.is_empty() {
            return DeleteOutcome::default();
        }

        let mut outcome = DeleteOutcome::default();

        if self.activated >= 0 {
            let activated = self.activated as usize;
            if targets.contains(&activated) {
                self.activated = -1;
                outcome.disconnect_requested = true;
            } else {
                let below = targets.iter().filter(|i| **i < activated).count();
                self.activated -= below as i64;
            }
        }

        let old = std::mem::take(&mut self.factories);
        for (index, factory) in old.into_iter().enumerate() {
            if targets.contains(&index) {
                factory.mark_deleted();
                outcome.removed.push(factory);
            } else {
                self.factories.push(factory);
            }
        }

        log::debug!("已删除 {} 个服务器", outcome.removed.len());
        outcome
    }

    // 交换两行，激活状态跟随原条目
    pub fn swap(&mut self, i: usize, j: usize) -> Result<(), String> {
        let len = self.factories.len();
        if i >= len || j >= len {
            return Err(format!("下标越界：{} / {}（共 {} 项）", i, j, len));
        }

        self.factories.swap(i, j);

        if self.activated == i as i64 {
            self.activated = j as i64;
        } else if self.activated == j as i64 {
            self.activated = i as i64;
        }

        Ok(())
    }

    // 激活为 true 时记录下标；为 false 时仅是界面状态，不影响记录的下标
    pub fn activate(&mut self, index: i64, activated: bool) -> bool {
        if !activated {
            return false;
        }

        if index < -1 || index >= self.factories.len() as i64 {
            log::warn!("忽略越界的激活下标：{}", index);
            return false;
        }

        self.activated = index;
        true
    }

    pub fn clear_activation(&mut self) {
        self.activated = -1;
    }

    fn sort_key(&self, factory: &ConfigFactory, column: SortColumn) -> SortKey {
        let text = |s: String| {
            if s.is_empty() {
                SortKey::Missing
            } else {
                SortKey::Text(s)
            }
        };

        match column {
            SortColumn::Remark => text(factory.remark.clone()),
            SortColumn::Protocol => text(factory.item_protocol()),
            SortColumn::Address => text(factory.item_address()),
            SortColumn::Port => leading_number(&factory.item_port()),
            SortColumn::Transport => text(factory.item_transport()),
            SortColumn::Tls => text(factory.item_tls()),
            SortColumn::Subscription => text(
                self.subscriptions
                    .get(&factory.subs_id)
                    .map(|s| s.remark.clone())
                    .unwrap_or_default(),
            ),
            SortColumn::Latency => leading_number(&factory.delay_result),
            SortColumn::Speed => leading_number(&factory.speed_result),
        }
    }

    // 稳定排序；缺失值始终排在末尾，激活状态跟随原条目
    pub fn sort_by(&mut self, column: SortColumn, reverse: bool) {
        let activated_id = self.activated().map(ConfigFactory::id);

        let mut keyed: Vec<(SortKey, ConfigFactory)> = std::mem::take(&mut self.factories)
            .into_iter()
            .map(|f| (self.sort_key(&f, column), f))
            .collect();

        keyed.sort_by(|(a, _), (b, _)| match (a, b) {
            (SortKey::Missing, _) | (_, SortKey::Missing) => a.compare(b),
            _ if reverse => b.compare(a),
            _ => a.compare(b),
        });

        self.factories = keyed.into_iter().map(|(_, f)| f).collect();

        if let Some(id) = activated_id {
            self.activated = self.find_by_id(id).map(|i| i as i64).unwrap_or(-1);
        }
    }

    pub fn scan_by_subs_id(&self, subs_id: &str) -> Vec<usize> {
        self.factories
            .iter()
            .enumerate()
            .filter(|(_, f)| f.subs_id == subs_id)
            .map(|(i, _)| i)
            .collect()
    }

    // 复制指定行到列表末尾，返回新行下标
    pub fn duplicate(&mut self, indices: &[usize]) -> Vec<usize> {
        let copies: Vec<ConfigFactory> = indices
            .iter()
            .filter_map(|i| self.factories.get(*i))
            .map(ConfigFactory::deep_copy)
            .collect();

        copies.into_iter().map(|f| self.append(f)).collect()
    }

    // 定位仍然存活的目标：优先使用下标提示，其次按句柄查找
    fn live_target(&mut self, index: usize, id: FactoryId) -> Option<&mut ConfigFactory> {
        let position = match self.factories.get(index) {
            Some(f) if f.id() == id => Some(index),
            _ => self.find_by_id(id),
        }?;

        self.factories.get_mut(position).filter(|f| !f.is_deleted())
    }

    pub fn apply_delay_result(&mut self, index: usize, id: FactoryId, result: &str) -> Option<usize> {
        let factory = self.live_target(index, id)?;
        factory.delay_result = result.to_string();
        self.find_by_id(id)
    }

    pub fn apply_speed_result(&mut self, index: usize, id: FactoryId, result: &str) -> Option<usize> {
        let factory = self.live_target(index, id)?;
        factory.speed_result = result.to_string();
        self.find_by_id(id)
    }

    // 新增订阅，返回随机生成的唯一标识
    pub fn add_subscription(&mut self, remark: &str, web_url: &str) -> String {
        let id = new_subscription_id(&self.subscriptions);

        self.subscriptions.insert(
            id.clone(),
            Subscription {
                remark: remark.to_string(),
                web_url: web_url.to_string(),
            },
        );

        id
    }

    pub fn edit_subscription(&mut self, id: &str, remark: &str, web_url: &str) -> Result<(), String> {
        let subscription = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| format!("订阅不存在：{}", id))?;

        subscription.remark = remark.to_string();
        subscription.web_url = web_url.to_string();
        Ok(())
    }

    // 删除订阅；其条目保留为手动导入
    pub fn remove_subscription(&mut self, id: &str) -> Option<Subscription> {
        let removed = self.subscriptions.remove(id)?;

        for factory in self.factories.iter_mut().filter(|f| f.subs_id == id) {
            factory.subs_id.clear();
        }

        Some(removed)
    }

    // 订阅对账：删除该订阅的全部旧条目，按远端顺序追加新条目
    pub fn reconcile_subscription(
        &mut self,
        subs_id: &str,
        factories: Vec<ConfigFactory>,
    ) -> DeleteOutcome {
        let stale = self.scan_by_subs_id(subs_id);
        let outcome = self.delete_by_index(&stale);

        let count = factories.len();
        for mut factory in factories {
            factory.subs_id = subs_id.to_string();
            self.append(factory);
        }

        log::info!(
            "订阅 {} 对账完成：移除 {} 项，新增 {} 项",
            subs_id,
            outcome.removed.len(),
            count
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::ConfigKind;
    use serde_json::json;

    fn factory(remark: &str) -> ConfigFactory {
        ConfigFactory::from_json(ConfigKind::Hysteria2, json!({ "server": "h.example.com:443" }))
            .with_remark(remark)
    }

    fn registry(remarks: &[&str]) -> ServerRegistry {
        let mut registry = ServerRegistry::new();
        for remark in remarks {
            registry.append(factory(remark));
        }
        registry
    }

    fn remarks(registry: &ServerRegistry) -> Vec<String> {
        registry.factories().iter().map(|f| f.remark.clone()).collect()
    }

    #[test]
    fn test_delete_preserves_activation() {
        let mut registry = registry(&["A", "B", "C", "D"]);
        registry.activate(2, true);

        let outcome = registry.delete_by_index(&[0, 3]);

        assert_eq!(remarks(&registry), vec!["B", "C"]);
        assert_eq!(registry.activated_index(), 1);
        assert!(!outcome.disconnect_requested);
        assert!(outcome.removed.iter().all(ConfigFactory::is_deleted));
    }

    #[test]
    fn test_delete_activated_clears_activation() {
        let mut registry = registry(&["A", "B", "C"]);
        registry.activate(1, true);
        let token = registry.get(1).unwrap().deletion_token();

        let outcome = registry.delete_by_index(&[1]);

        assert_eq!(remarks(&registry), vec!["A", "C"]);
        assert_eq!(registry.activated_index(), -1);
        assert!(outcome.disconnect_requested);
        assert!(token.is_deleted());
    }

    #[test]
    fn test_delete_ignores_duplicates_and_out_of_range() {
        let mut registry = registry(&["A", "B", "C"]);
        registry.activate(2, true);

        let outcome = registry.delete_by_index(&[0, 0, 9]);

        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.activated_index(), 1);
    }

    #[test]
    fn test_swap_moves_activation() {
        let mut registry = registry(&["A", "B", "C"]);
        registry.activate(0, true);

        registry.swap(0, 2).unwrap();

        assert_eq!(remarks(&registry), vec!["C", "B", "A"]);
        assert_eq!(registry.activated_index(), 2);
        assert!(registry.swap(0, 3).is_err());
    }

    #[test]
    fn test_activate_false_keeps_index() {
        let mut registry = registry(&["A", "B"]);
        registry.activate(1, true);

        assert!(!registry.activate(0, false));
        assert_eq!(registry.activated_index(), 1);
        assert!(!registry.activate(5, true));
        assert_eq!(registry.activated_index(), 1);
    }

    #[test]
    fn test_sort_by_latency_puts_missing_last() {
        let mut registry = registry(&["A", "B", "C", "D"]);
        registry.get_mut(0).unwrap().delay_result = "120ms".to_string();
        registry.get_mut(1).unwrap().delay_result = "Timeout".to_string();
        registry.get_mut(2).unwrap().delay_result = "35ms".to_string();
        registry.activate(0, true);

        registry.sort_by(SortColumn::Latency, false);
        assert_eq!(remarks(&registry), vec!["C", "A", "B", "D"]);
        assert_eq!(registry.activated_index(), 1);

        registry.sort_by(SortColumn::Latency, true);
        assert_eq!(remarks(&registry)[..2], ["A", "C"]);
    }

    #[test]
    fn test_reconcile_subscription() {
        let mut registry = ServerRegistry::new();
        let subs_id = registry.add_subscription("s", "https://example.com/sub");

        registry.append(factory("A"));
        for remark in ["B", "C"] {
            let mut f = factory(remark);
            f.subs_id = subs_id.clone();
            registry.append(f);
        }

        registry.reconcile_subscription(&subs_id, vec![factory("X"), factory("Y")]);

        assert_eq!(remarks(&registry), vec!["A", "X", "Y"]);
        assert_eq!(registry.scan_by_subs_id(&subs_id), vec![1, 2]);
        assert!(registry.get(0).unwrap().subs_id.is_empty());
    }

    #[test]
    fn test_results_skip_deleted_targets() {
        let mut registry = registry(&["A", "B"]);
        let id_a = registry.get(0).unwrap().id();
        let id_b = registry.get(1).unwrap().id();

        registry.delete_by_index(&[0]);

        assert_eq!(registry.apply_delay_result(0, id_a, "10ms"), None);
        // 下标已变化，按句柄找到新位置
        assert_eq!(registry.apply_delay_result(1, id_b, "20ms"), Some(0));
        assert_eq!(registry.get(0).unwrap().delay_result, "20ms");
    }

    #[test]
    fn test_duplicate_appends_independent_copies() {
        let mut registry = registry(&["A", "B"]);

        let new = registry.duplicate(&[0, 1]);

        assert_eq!(new, vec![2, 3]);
        assert_eq!(remarks(&registry), vec!["A", "B", "A", "B"]);
        assert_ne!(registry.get(0).unwrap().id(), registry.get(2).unwrap().id());
    }

    #[test]
    fn test_remove_subscription_detaches_items() {
        let mut registry = ServerRegistry::new();
        let subs_id = registry.add_subscription("s", "https://example.com/sub");
        let mut f = factory("A");
        f.subs_id = subs_id.clone();
        registry.append(f);

        assert!(registry.remove_subscription(&subs_id).is_some());
        assert!(registry.scan_by_subs_id(&subs_id).is_empty());
        assert_eq!(subs_id.len(), 32);
    }
}
