//! mysql_async 기반 복제 소스
//!
//! 복제 프로토콜(핸드셰이크, 인증, COM_BINLOG_DUMP, 이벤트 파싱)은 mysql_async에
//! 맡기고, 여기서는 다음만 처리합니다:
//! - ROTATE 이벤트로 현재 binlog 파일명 추적
//! - TABLE_MAP + ROWS 이벤트를 테이블 필터에 맞춰 원시 행 알림으로 변환
//! - 테이블별 컬럼 메타데이터를 세션 동안 캐시

use crate::connection::{open_conn, ConnectionConfig, MySqlConnection};
use crate::error::{CdcError, Result};
use crate::events::{RowAction, RowsNotification, TableRef, TableSchema};
use crate::offset::BinlogPosition;
use crate::source::{ReplicationSource, SourceConfig, SourceFactory, SourceOutput};
use futures::StreamExt;
use mysql_async::binlog::events::EventData;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStreamRequest, Conn, Value as MySqlValue};
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// MySQL 서버용 소스 생성기
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlSourceFactory;

impl SourceFactory for MySqlSourceFactory {
    type Source = BinlogClient;

    async fn open(&self, config: SourceConfig) -> Result<BinlogClient> {
        let connection = ConnectionConfig::from(&config);
        info!("Connecting to MySQL at {}", connection.address());

        // 메타데이터 조회용 연결과 binlog 스트림용 연결을 따로 맺음
        let metadata = MySqlConnection::connect(&connection).await?;
        let conn = open_conn(&connection).await?;

        Ok(BinlogClient {
            config,
            metadata,
            conn,
        })
    }
}

/// Binlog 클라이언트
pub struct BinlogClient {
    config: SourceConfig,
    metadata: MySqlConnection,
    conn: Conn,
}

impl ReplicationSource for BinlogClient {
    async fn current_position(&mut self) -> Result<BinlogPosition> {
        self.metadata.get_binlog_status().await
    }

    fn stream(
        self,
        from: BinlogPosition,
        output: SourceOutput,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.run(from, output)
    }
}

impl BinlogClient {
    async fn run(self, from: BinlogPosition, mut output: SourceOutput) -> Result<()> {
        let BinlogClient {
            config,
            mut metadata,
            conn,
        } = self;

        let request = BinlogStreamRequest::new(config.server_id)
            .with_filename(from.name.as_bytes())
            .with_pos(from.position);
        let mut stream = conn.get_binlog_stream(request).await.map_err(|e| {
            CdcError::StreamError(format!("Failed to start binlog dump at {}: {}", from, e))
        })?;

        info!("Binlog streaming started from {}", from);
        output.log(format!("binlog streaming started from {}", from));

        let mut file = from.name.clone();
        let mut schemas: HashMap<TableRef, Arc<TableSchema>> = HashMap::new();

        loop {
            let next = tokio::select! {
                _ = output.stopped() => None,
                event = stream.next() => Some(event),
            };

            let Some(event) = next else {
                info!("Binlog streaming stopped in {}", file);
                drop(stream);
                if let Err(e) = metadata.close().await {
                    debug!("Metadata connection close failed: {}", e);
                }
                return Ok(());
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    return Err(CdcError::StreamError(format!("Failed to read binlog event: {}", e)))
                }
                None => {
                    return Err(CdcError::StreamError("Binlog stream closed by server".to_string()))
                }
            };

            let position = BinlogPosition::new(file.clone(), u64::from(event.header().log_pos()));
            let data = event.read_data().map_err(|e| {
                CdcError::StreamError(format!("Failed to parse binlog event at {}: {}", position, e))
            })?;

            let rows_event = match data {
                Some(EventData::RotateEvent(rotate)) => {
                    let next = rotate.name().into_owned();
                    if next != file {
                        debug!("Binlog rotated to {}:{}", next, rotate.position());
                        output.log(format!("binlog rotated to {}:{}", next, rotate.position()));
                        file = next;
                    }
                    continue;
                }
                Some(EventData::RowsEvent(rows_event)) => rows_event,
                _ => continue,
            };

            let Some(tme) = stream.get_tme(rows_event.table_id()) else {
                warn!("Rows event without table map at {}", position);
                output.log(format!("skipping rows event without table map at {}", position));
                continue;
            };

            let table = TableRef::new(tme.database_name(), tme.table_name());
            if !config.tables.matches(&table) {
                continue;
            }

            let schema = match schemas.get(&table) {
                Some(schema) => schema.clone(),
                None => match metadata.get_table_schema(&table).await {
                    Ok(schema) => {
                        let schema = Arc::new(schema);
                        schemas.insert(table.clone(), schema.clone());
                        schema
                    }
                    Err(err) if skips_rows_event(&err) => {
                        warn!("Skipping rows event at {}: {}", position, err);
                        output.log(format!("skipping rows event at {}: {}", position, err));
                        continue;
                    }
                    Err(err) => return Err(err),
                },
            };

            let mut action = None;
            let mut rows = Vec::new();
            for row in rows_event.rows(tme) {
                let (before, after) = row.map_err(|e| {
                    CdcError::StreamError(format!(
                        "Failed to decode rows of {} at {}: {}",
                        table, position, e
                    ))
                })?;
                let kind = match (&before, &after) {
                    (None, Some(_)) => RowAction::Insert,
                    (Some(_), Some(_)) => RowAction::Update,
                    (Some(_), None) => RowAction::Delete,
                    (None, None) => continue,
                };
                action.get_or_insert(kind);
                rows.extend(before.iter().chain(after.iter()).map(row_values));
            }

            let Some(action) = action else {
                continue;
            };

            debug!("{} {} row image(s) on {} at {}", action.as_str(), rows.len(), table, position);
            let notification = RowsNotification {
                position,
                schema,
                action,
                rows,
            };
            if output.rows.send(notification).await.is_err() {
                // 세션이 이미 닫힘
                return Ok(());
            }
        }
    }
}

/// 메타데이터 조회 실패 시 스트림을 끝내지 않고 이벤트만 건너뛸지 여부
///
/// 이미 삭제된 테이블의 과거 이벤트는 건너뜁니다.
fn skips_rows_event(err: &CdcError) -> bool {
    matches!(err, CdcError::TableNotFound(_))
}

fn row_values(row: &BinlogRow) -> Vec<Value> {
    (0..row.len())
        .map(|idx| row.as_ref(idx).map(binlog_value_to_json).unwrap_or(Value::Null))
        .collect()
}

/// binlog 값을 JSON으로 변환
pub fn binlog_value_to_json(value: &BinlogValue<'_>) -> Value {
    match value {
        BinlogValue::Value(value) => mysql_value_to_json(value),
        BinlogValue::Jsonb(doc) => match doc.clone().parse() {
            Ok(dom) => Value::from(dom),
            Err(e) => {
                warn!("Failed to parse JSON column: {}", e);
                Value::Null
            }
        },
        // 부분 업데이트(PARTIAL_JSON)는 전체 문서가 없으므로 diff 텍스트로 전달
        BinlogValue::JsonDiff(diffs) => Value::String(format!("{:?}", diffs)),
    }
}

pub fn mysql_value_to_json(value: &MySqlValue) -> Value {
    match value {
        MySqlValue::NULL => Value::Null,
        MySqlValue::Int(v) => Value::from(*v),
        MySqlValue::UInt(v) => Value::from(*v),
        MySqlValue::Float(v) => float_to_json(f64::from(*v)),
        MySqlValue::Double(v) => float_to_json(*v),
        MySqlValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        },
        MySqlValue::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            Value::String(text)
        }
        MySqlValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if *negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            Value::String(text)
        }
    }
}

fn float_to_json(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}
