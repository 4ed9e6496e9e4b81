//! CDC 브리지 에러 타입

use crate::events::TableRef;
use crate::offset::BinlogPosition;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("query error: {0}")]
    QueryError(String),

    #[error("table not found: {0}")]
    TableNotFound(TableRef),

    #[error("replication stream error: {0}")]
    StreamError(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid table regex: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("invalid session handle: {0}")]
    InvalidHandle(u64),
}

impl CdcError {
    /// 에러가 스트림의 특정 위치에서 발생한 경우 그 위치
    pub fn position(&self) -> Option<&BinlogPosition> {
        match self {
            CdcError::Decode(err) => Some(&err.position),
            _ => None,
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

/// 행 디코딩 실패 원인
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeReason {
    #[error("enum metadata missing")]
    EnumMetadataMissing,

    #[error("enum value not integer")]
    EnumValueNotInteger,

    #[error("enum value out of range")]
    EnumValueOutOfRange,

    #[error("set metadata missing")]
    SetMetadataMissing,

    #[error("set value not integer")]
    SetValueNotInteger,

    #[error("set value out of range")]
    SetValueOutOfRange,

    /// 행 값 개수와 컬럼 개수 불일치
    #[error("row has {values} values but table has {columns} columns")]
    ColumnCountMismatch { values: usize, columns: usize },

    /// UPDATE 이벤트에 변경 후 이미지가 없음
    #[error("update row without post-image")]
    MissingPostImage,
}

/// 위치 정보가 붙은 디코딩 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason} ({})", location(.table, .column))]
pub struct DecodeError {
    pub position: BinlogPosition,
    pub table: TableRef,
    pub column: Option<String>,
    pub reason: DecodeReason,
}

fn location(table: &TableRef, column: &Option<String>) -> String {
    match column {
        Some(column) => format!("column {}.{}", table, column),
        None => format!("table {}", table),
    }
}

/// 제어 메시지 디코딩 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("failed to parse message: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

pub type Result<T> = std::result::Result<T, CdcError>;
