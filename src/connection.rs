//! MySQL 메타데이터 연결 관리
//!
//! 복제 스트림과 별도의 일반 연결로 head 위치와 컬럼 메타데이터를 조회합니다.

use crate::error::{CdcError, Result};
use crate::events::{ColumnKind, ColumnMetadata, TableRef, TableSchema};
use crate::offset::BinlogPosition;
use crate::source::SourceConfig;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use tracing::debug;

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl From<&SourceConfig> for ConnectionConfig {
    fn from(config: &SourceConfig) -> Self {
        ConnectionConfig {
            hostname: config.hostname.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

impl ConnectionConfig {
    pub fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .into()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// 연결을 맺음 (인증 실패 포함)
pub async fn open_conn(config: &ConnectionConfig) -> Result<Conn> {
    Conn::new(config.build_opts()).await.map_err(|e| {
        CdcError::ConnectionError(format!("Failed to connect to {}: {}", config.address(), e))
    })
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = open_conn(config).await?;
        debug!("Connected to MySQL at {}", config.address());
        Ok(MySqlConnection { conn })
    }

    /// 현재 binlog head 위치 조회
    pub async fn get_binlog_status(&mut self) -> Result<BinlogPosition> {
        // 8.2 이전 서버는 SHOW MASTER STATUS만 지원
        let row: Option<Row> = match self.conn.query_first("SHOW BINARY LOG STATUS").await {
            Ok(row) => row,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed ({}), retrying legacy syntax", e);
                self.conn
                    .query_first("SHOW MASTER STATUS")
                    .await
                    .map_err(|e| {
                        CdcError::QueryError(format!("Failed to query binlog status: {}", e))
                    })?
            }
        };

        let row = row.ok_or_else(|| {
            CdcError::QueryError("No binlog status available (is binary logging enabled?)".to_string())
        })?;

        let file = row
            .get_opt::<String, usize>(0)
            .and_then(|v| v.ok())
            .ok_or_else(|| CdcError::QueryError("Binlog status has no file name".to_string()))?;
        let position = row
            .get_opt::<u64, usize>(1)
            .and_then(|v| v.ok())
            .ok_or_else(|| CdcError::QueryError("Binlog status has no position".to_string()))?;

        Ok(BinlogPosition::new(file, position))
    }

    /// 테이블 컬럼 메타데이터 조회 (ENUM/SET 라벨 포함)
    pub async fn get_table_schema(&mut self, table: &TableRef) -> Result<TableSchema> {
        let rows: Vec<(String, String, String)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (table.schema.as_str(), table.name.as_str()),
            )
            .await
            .map_err(|e| {
                CdcError::QueryError(format!("Failed to query schema of {}: {}", table, e))
            })?;

        if rows.is_empty() {
            return Err(CdcError::TableNotFound(table.clone()));
        }

        let columns = rows
            .into_iter()
            .map(|(name, data_type, column_type)| {
                let kind = ColumnKind::from_data_type(&data_type);
                let labels = match kind {
                    ColumnKind::Plain => None,
                    ColumnKind::Enum | ColumnKind::Set => parse_labels(&column_type),
                };
                ColumnMetadata {
                    name,
                    type_name: column_type,
                    kind,
                    labels,
                }
            })
            .collect();

        debug!("Loaded column metadata for {}", table);
        Ok(TableSchema {
            table: table.clone(),
            columns,
        })
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to disconnect: {}", e)))
    }
}

/// `enum('a','b''c')` 형식의 COLUMN_TYPE에서 라벨 목록 추출
///
/// 따옴표 안의 `''`는 작은따옴표 하나입니다.
pub fn parse_labels(column_type: &str) -> Option<Vec<String>> {
    let open = column_type.find('(')?;
    let close = column_type.rfind(')')?;
    if close <= open {
        return None;
    }

    let mut labels = Vec::new();
    let mut chars = column_type[open + 1..close].chars().peekable();
    loop {
        match chars.next() {
            None => break,
            Some('\'') => {}
            Some(',') | Some(' ') => continue,
            Some(_) => return None,
        }

        let mut label = String::new();
        loop {
            match chars.next()? {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    label.push('\'');
                }
                '\'' => break,
                c => label.push(c),
            }
        }
        labels.push(label);
    }

    Some(labels)
}
