use crate::resource::model::ResourceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// 物理文件的存储键，形如 "2024-05-01/<uuid>.pdf"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// 在指定日期分桶下生成新的随机键
    pub fn generate(bucket: &str, extension: Option<&str>) -> Self {
        let token = Uuid::new_v4();
        match extension {
            Some(ext) => StorageKey(format!("{}/{}.{}", bucket, token, ext)),
            None => StorageKey(format!("{}/{}", bucket, token)),
        }
    }

    /// 解析外部传入的键，拒绝任何可能逃逸存储根目录的写法
    pub fn parse(raw: &str) -> Result<Self, ResourceError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('/') || raw.contains('\\') {
            return Err(ResourceError::InvalidOperation(format!(
                "非法的存储键: {}",
                raw
            )));
        }

        let segments: Vec<&str> = raw.split('/').collect();
        if segments.len() > 2
            || segments
                .iter()
                .any(|s| s.is_empty() || *s == "." || *s == "..")
        {
            return Err(ResourceError::InvalidOperation(format!(
                "非法的存储键: {}",
                raw
            )));
        }

        Ok(StorageKey(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日期分桶目录，旧数据可能没有分桶
    pub fn bucket(&self) -> Option<&str> {
        self.0.split_once('/').map(|(bucket, _)| bucket)
    }

    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.0).extension().and_then(|e| e.to_str())
    }
}

/// 从原始文件名中取出可以安全用于存储键的扩展名
pub fn extension_of(original_name: &str) -> Option<&str> {
    Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = ResourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorageKey::parse(&value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_keeps_bucket_and_extension() {
        let key = StorageKey::generate("2024-05-01", Some("pdf"));
        assert_eq!(key.bucket(), Some("2024-05-01"));
        assert_eq!(key.extension(), Some("pdf"));
        assert!(StorageKey::parse(key.as_str()).is_ok());
    }

    #[test]
    fn parse_rejects_escaping_paths() {
        for raw in ["", "/etc/passwd", "../x", "a/../b", "a/b/c", "a//b", "a\\b"] {
            assert!(StorageKey::parse(raw).is_err(), "{} should be rejected", raw);
        }
        assert!(StorageKey::parse("legacy.txt").is_ok());
    }

    #[test]
    fn extension_of_ignores_unsafe_suffixes() {
        assert_eq!(extension_of("report.PDF"), Some("PDF"));
        assert_eq!(extension_of("archive.tar.gz"), Some("gz"));
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of("weird.a b"), None);
    }
}
