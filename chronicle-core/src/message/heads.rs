use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Record;

/// 各源流最后应用的序号（head）
///
/// 既用于去重（序号不大于 head 的记录视为已应用），也作为乐观并发令牌与因果等待条件。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Heads(BTreeMap<String, u64>);

impl Heads {
    pub fn new() -> Self {
        Self::default()
    }

    /// 仅包含一个流位点
    pub fn single(stream_id: impl Into<String>, sequence: u64) -> Self {
        let mut heads = Self::new();
        heads.0.insert(stream_id.into(), sequence);
        heads
    }

    /// 取每条流中最大的记录序号，常用于构造 read-your-writes 查询
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut heads = Self::new();
        for record in records {
            heads.advance(&record.stream_id, record.sequence);
        }
        heads
    }

    /// 流的当前 head，未出现过的流为 0
    pub fn get(&self, stream_id: &str) -> u64 {
        self.0.get(stream_id).copied().unwrap_or(0)
    }

    /// 推进流位点；位点只增不减，返回是否发生推进
    pub fn advance(&mut self, stream_id: &str, sequence: u64) -> bool {
        match self.0.get_mut(stream_id) {
            Some(head) if *head >= sequence => false,
            Some(head) => {
                *head = sequence;
                true
            }
            None => {
                self.0.insert(stream_id.to_string(), sequence);
                true
            }
        }
    }

    /// 逐流取较大值
    pub fn merge(&mut self, other: &Heads) {
        for (stream_id, sequence) in &other.0 {
            self.advance(stream_id, *sequence);
        }
    }

    /// 是否在 `required` 的每条流上都不低于请求位点
    pub fn covers(&self, required: &Heads) -> bool {
        required
            .0
            .iter()
            .all(|(stream_id, sequence)| self.get(stream_id) >= *sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for Heads {
    fn from_iter<T: IntoIterator<Item = (K, u64)>>(iter: T) -> Self {
        let mut heads = Heads::new();
        for (stream_id, sequence) in iter {
            heads.advance(&stream_id.into(), sequence);
        }
        heads
    }
}

impl<K: Into<String>, const N: usize> From<[(K, u64); N]> for Heads {
    fn from(pairs: [(K, u64); N]) -> Self {
        pairs.into_iter().collect()
    }
}
