use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// 快照兼容版本
///
/// 由实现者显式给出，状态形状变化时手动提升。也可以基于一份显式的
/// schema 描述计算内容哈希（见 [`SnapshotVersion::from_schema`]）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotVersion(String);

impl SnapshotVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// 对规范化后的 schema 描述取 SHA-256，截取前 16 位十六进制
    ///
    /// ```
    /// use chronicle_core::unit::SnapshotVersion;
    /// use serde_json::json;
    ///
    /// let a = SnapshotVersion::from_schema(&json!({"bards": "array", "count": "int"}));
    /// let b = SnapshotVersion::from_schema(&json!({"count": "int", "bards": "array"}));
    /// assert_eq!(a, b);
    /// assert_eq!(a.as_str().len(), 16);
    /// ```
    pub fn from_schema(descriptor: &Value) -> Self {
        let canonical = canonicalize(descriptor).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 逐层按键排序重建对象；不依赖 serde_json 是否启用 `preserve_order`
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SnapshotVersion {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<u32> for SnapshotVersion {
    fn from(value: u32) -> Self {
        Self::new(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_key_order_does_not_change_the_version() {
        let a = SnapshotVersion::from_schema(&json!({
            "account": {"owner": "string", "balance": "int"},
            "tags": [{"b": 1, "a": 2}],
        }));
        let b = SnapshotVersion::from_schema(&json!({
            "tags": [{"a": 2, "b": 1}],
            "account": {"balance": "int", "owner": "string"},
        }));
        assert_eq!(a, b);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        let c = SnapshotVersion::from_schema(&json!({"account": {"owner": "string"}}));
        assert_ne!(a, c);
    }
}
