//! Binlog 재시작 위치
//!
//! Binlog 파일명 + 파일 내 오프셋으로 스트림 위치를 나타냅니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치
//!
//! 위치는 불투명한 값으로 취급합니다. 로그와 리포트에만 쓰이고
//! 브리지가 직접 비교하거나 계산하지 않습니다.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub name: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(name: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            name: name.into(),
            position,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.position)
    }
}
