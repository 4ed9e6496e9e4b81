//! 변경 이벤트 타입 및 데이터 구조 정의

use crate::offset::BinlogPosition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// 변경된 테이블 (스키마명 + 테이블명)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableRef {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// 디코딩 방식을 결정하는 컬럼 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// 1부터 시작하는 서수로 저장되는 ENUM
    Enum,
    /// 비트마스크로 저장되는 SET
    Set,
    /// 그대로 전달되는 나머지 타입
    Plain,
}

impl ColumnKind {
    /// INFORMATION_SCHEMA의 DATA_TYPE 값으로부터 분류
    pub fn from_data_type(data_type: &str) -> Self {
        if data_type.eq_ignore_ascii_case("enum") {
            ColumnKind::Enum
        } else if data_type.eq_ignore_ascii_case("set") {
            ColumnKind::Set
        } else {
            ColumnKind::Plain
        }
    }
}

/// 컬럼 메타데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    /// 선언된 타입 (e.g., "int", "enum('a','b')")
    pub type_name: String,
    pub kind: ColumnKind,
    /// ENUM/SET 라벨 목록 (선언 순서)
    pub labels: Option<Vec<String>>,
}

impl ColumnMetadata {
    pub fn plain(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ColumnMetadata {
            name: name.into(),
            type_name: type_name.into(),
            kind: ColumnKind::Plain,
            labels: None,
        }
    }

    pub fn enumeration<S: Into<String>>(name: impl Into<String>, labels: Vec<S>) -> Self {
        ColumnMetadata {
            name: name.into(),
            type_name: "enum".to_string(),
            kind: ColumnKind::Enum,
            labels: Some(labels.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set<S: Into<String>>(name: impl Into<String>, labels: Vec<S>) -> Self {
        ColumnMetadata {
            name: name.into(),
            type_name: "set".to_string(),
            kind: ColumnKind::Set,
            labels: Some(labels.into_iter().map(Into::into).collect()),
        }
    }
}

/// 테이블 스키마 (세션 동안 불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: TableRef,
    pub columns: Vec<ColumnMetadata>,
}

/// 행 변경 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }
}

/// 컬럼명 → 값 매핑 (컬럼 순서 유지)
pub type RowImage = serde_json::Map<String, Value>;

/// 복제 소스가 전달하는 원시 행 변경 알림
///
/// `rows`의 각 행은 `schema.columns`와 위치로 정렬됩니다.
/// UPDATE의 경우 변경 전/후 이미지가 번갈아 들어 있습니다.
#[derive(Debug, Clone)]
pub struct RowsNotification {
    pub position: BinlogPosition,
    pub schema: Arc<TableSchema>,
    pub action: RowAction,
    pub rows: Vec<Vec<Value>>,
}

/// 정규화된 행 변경 (insert/update/delete 중 정확히 하나)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowChange {
    Insert(RowImage),
    Update { old: RowImage, new: RowImage },
    Delete(RowImage),
}

/// 호출자에게 전달되는 변경 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub binlog_position: BinlogPosition,
    pub table: TableRef,
    #[serde(flatten)]
    pub change: RowChange,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_event_has_exactly_one_payload() {
        let mut old = RowImage::new();
        old.insert("id".to_string(), json!(1));
        let mut new = old.clone();
        new.insert("name".to_string(), json!("b"));

        let event = ChangeEvent {
            binlog_position: BinlogPosition::new("mysql-bin.000001", 500),
            table: TableRef::new("app", "users"),
            change: RowChange::Update { old, new },
        };

        let value = serde_json::to_value(&event).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object["binlogPosition"]["position"], 500);
        assert_eq!(object["table"]["schema"], "app");
        assert!(object.contains_key("update"));
        assert!(!object.contains_key("insert"));
        assert!(!object.contains_key("delete"));
        assert_eq!(object["update"]["new"]["name"], "b");
    }

    #[test]
    fn test_column_kind_from_data_type() {
        assert_eq!(ColumnKind::from_data_type("enum"), ColumnKind::Enum);
        assert_eq!(ColumnKind::from_data_type("SET"), ColumnKind::Set);
        assert_eq!(ColumnKind::from_data_type("varchar"), ColumnKind::Plain);
    }
}
