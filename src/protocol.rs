//! 줄 단위 JSON 제어 프로토콜
//!
//! 입력 한 줄 = 제어 메시지 하나, 출력 한 줄 = 리포트 메시지 하나.
//! 두 방향 모두 `type` 필드로 구분합니다.
//!
//! 입력:
//!   {"type":"connect","config":{hostname, port, username, password, tableRegexes, binlogPosition?}}
//! 출력:
//!   connect_ok | connect_error | binlog_change | log | error

use crate::error::{CdcError, ProtocolError, Result};
use crate::events::ChangeEvent;
use crate::offset::BinlogPosition;
use crate::source::{SourceConfig, TableFilter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 입력 리더가 엔진에 넘기는 항목
pub type Inbound = std::result::Result<ControlMessage, ProtocolError>;

/// `connect` 명령의 설정
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub table_regexes: Vec<String>,
    /// 없으면 현재 head부터
    #[serde(default)]
    pub binlog_position: Option<BinlogPosition>,
    #[serde(default)]
    pub server_id: Option<u32>,
}

impl ConnectConfig {
    /// 테이블 패턴을 컴파일해 소스 설정으로 변환
    pub fn source_config(&self, default_server_id: u32) -> Result<SourceConfig> {
        Ok(SourceConfig {
            hostname: self.hostname.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            server_id: self.server_id.unwrap_or(default_server_id),
            tables: TableFilter::new(&self.table_regexes)?,
        })
    }
}

/// 제어 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Connect(ConnectConfig),
}

#[derive(Deserialize)]
struct ConnectBody {
    config: ConnectConfig,
}

/// 입력 한 줄 디코딩
pub fn decode_line(line: &str) -> Inbound {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing message type".to_string()))?;

    match kind {
        "connect" => {
            let body: ConnectBody = serde_json::from_value(value.clone())
                .map_err(|e| ProtocolError::Malformed(format!("invalid connect message: {}", e)))?;
            Ok(ControlMessage::Connect(body.config))
        }
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// 리포트 메시지
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    ConnectOk,
    ConnectError {
        error: String,
    },
    BinlogChange {
        event: ChangeEvent,
    },
    Log {
        message: String,
    },
    Error {
        error: String,
        #[serde(rename = "binlogPosition", skip_serializing_if = "Option::is_none")]
        binlog_position: Option<BinlogPosition>,
    },
}

impl Report {
    pub fn error(err: &CdcError) -> Self {
        Report::Error {
            error: err.to_string(),
            binlog_position: err.position().cloned(),
        }
    }

    pub fn connect_error(err: &CdcError) -> Self {
        Report::ConnectError {
            error: err.to_string(),
        }
    }
}

/// 리포트 하나를 한 줄로 인코딩 (개행 제외)
pub fn encode_report(report: &Report) -> Result<String> {
    Ok(serde_json::to_string(report)?)
}

/// 출력 싱크
///
/// 모든 쓰기가 하나의 락을 거치므로 동시에 써도 줄이 섞이지 않습니다.
/// 락은 한 줄을 쓰는 동안만 잡습니다.
pub struct ReportSink<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> Clone for ReportSink<W> {
    fn clone(&self) -> Self {
        ReportSink {
            writer: self.writer.clone(),
        }
    }
}

impl<W: Write> ReportSink<W> {
    pub fn new(writer: W) -> Self {
        ReportSink {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn emit(&self, report: &Report) -> Result<()> {
        let mut line = encode_report(report)?.into_bytes();
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// 제어 입력 한 줄의 최대 길이 (개행 제외)
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// 입력 스트림을 읽어 디코딩된 제어 메시지를 보내는 작업 시작
///
/// 입력이 끝나거나 수신자가 사라지면 종료합니다. 빈 줄은 무시합니다.
/// `MAX_LINE_BYTES`를 넘는 줄은 나머지를 버리고 `Malformed`로 보고합니다.
pub fn spawn_line_reader<R>(mut reader: R, capacity: usize) -> (mpsc::Receiver<Inbound>, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = (&mut reader)
                .take(MAX_LINE_BYTES as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await;
            match read {
                Ok(0) => {
                    debug!("Control input reached end of stream");
                    break;
                }
                Ok(_) => {
                    let inbound = if buf.len() > MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
                        if let Err(e) = skip_line(&mut reader).await {
                            warn!("Failed to read control input: {}", e);
                            break;
                        }
                        Err(ProtocolError::Malformed(format!(
                            "line exceeds {} bytes",
                            MAX_LINE_BYTES
                        )))
                    } else {
                        match std::str::from_utf8(&buf) {
                            Ok(line) if line.trim().is_empty() => continue,
                            Ok(line) => decode_line(line.trim()),
                            Err(e) => Err(ProtocolError::Malformed(e.to_string())),
                        }
                    };
                    if tx.send(inbound).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read control input: {}", e);
                    break;
                }
            }
        }
    });

    (rx, task)
}

/// 다음 개행(또는 EOF)까지 버림
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let (consumed, done) = {
            let chunk = reader.fill_buf().await?;
            match chunk.iter().position(|b| *b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (chunk.len(), chunk.is_empty()),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RowChange, RowImage, TableRef};
    use serde_json::json;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_decode_connect() {
        let line = r#"{"type":"connect","config":{"hostname":"db","port":3306,"username":"u","password":"p","tableRegexes":["app\\..*"]}}"#;
        let ControlMessage::Connect(config) = decode_line(line).unwrap();

        assert_eq!(config.hostname, "db");
        assert_eq!(config.port, 3306);
        assert_eq!(config.table_regexes, vec![r"app\..*".to_string()]);
        assert_eq!(config.binlog_position, None);
        assert_eq!(config.server_id, None);
    }

    #[test]
    fn test_decode_connect_with_position() {
        let line = r#"{"type":"connect","config":{"hostname":"db","port":3306,"username":"u","password":"p","tableRegexes":[],"binlogPosition":{"name":"mysql-bin.000003","position":4},"serverId":77}}"#;
        let ControlMessage::Connect(config) = decode_line(line).unwrap();

        assert_eq!(
            config.binlog_position,
            Some(BinlogPosition::new("mysql-bin.000003", 4))
        );
        let source = config.source_config(1001).unwrap();
        assert_eq!(source.server_id, 77);
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            decode_line(r#"{"type":"ping"}"#),
            Err(ProtocolError::UnknownType("ping".to_string()))
        );
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(decode_line("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode_line(r#"{"config":{}}"#), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode_line(r#"[1,2]"#), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode_line(r#"{"type":"connect","config":{"hostname":"db"}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_regex_fails_source_config() {
        let line = r#"{"type":"connect","config":{"hostname":"db","port":3306,"username":"u","password":"p","tableRegexes":["(oops"]}}"#;
        let ControlMessage::Connect(config) = decode_line(line).unwrap();
        assert!(matches!(
            config.source_config(1001),
            Err(CdcError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_report_shapes() {
        assert_eq!(
            encode_report(&Report::ConnectOk).unwrap(),
            r#"{"type":"connect_ok"}"#
        );
        assert_eq!(
            encode_report(&Report::ConnectError {
                error: "boom".to_string()
            })
            .unwrap(),
            r#"{"type":"connect_error","error":"boom"}"#
        );
        assert_eq!(
            encode_report(&Report::Log {
                message: "hi".to_string()
            })
            .unwrap(),
            r#"{"type":"log","message":"hi"}"#
        );
        assert_eq!(
            encode_report(&Report::Error {
                error: "bad".to_string(),
                binlog_position: None
            })
            .unwrap(),
            r#"{"type":"error","error":"bad"}"#
        );
    }

    #[test]
    fn test_binlog_change_shape() {
        let mut row = RowImage::new();
        row.insert("id".to_string(), json!(1));
        row.insert("status_enum".to_string(), json!("active"));

        let report = Report::BinlogChange {
            event: ChangeEvent {
                binlog_position: BinlogPosition::new("mysql-bin.000001", 42),
                table: TableRef::new("app", "orders"),
                change: RowChange::Insert(row),
            },
        };

        let value: Value = serde_json::from_str(&encode_report(&report).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "binlog_change",
                "event": {
                    "binlogPosition": {"name": "mysql-bin.000001", "position": 42},
                    "table": {"schema": "app", "name": "orders"},
                    "insert": {"id": 1, "status_enum": "active"}
                }
            })
        );
    }

    #[test]
    fn test_sink_never_interleaves_lines() {
        let buf = SharedBuf::default();
        let sink = ReportSink::new(buf.clone());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sink.emit(&Report::Log {
                            message: format!("thread {} line {}", t, i),
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let output = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            let value: Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["type"], "log");
        }
    }

    #[tokio::test]
    async fn test_line_reader_decodes_until_eof() {
        let input = tokio_test::io::Builder::new()
            .read(b"{\"type\":\"ping\"}\n\n")
            .read(b"garbage\n{\"type\":\"conn")
            .read(b"ect\",\"config\":{\"hostname\":\"db\",\"port\":1,\"username\":\"u\",\"password\":\"p\"}}\n")
            .build();

        let (mut rx, task) = spawn_line_reader(tokio::io::BufReader::new(input), 4);

        assert_eq!(
            rx.recv().await,
            Some(Err(ProtocolError::UnknownType("ping".to_string())))
        );
        assert!(matches!(rx.recv().await, Some(Err(ProtocolError::Malformed(_)))));
        assert!(matches!(
            rx.recv().await,
            Some(Ok(ControlMessage::Connect(config))) if config.hostname == "db" && config.table_regexes.is_empty()
        ));
        assert_eq!(rx.recv().await, None);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_reader_rejects_overlong_line_and_resyncs() {
        let mut long = vec![b'x'; MAX_LINE_BYTES + 10];
        long.push(b'\n');
        let input = tokio_test::io::Builder::new()
            .read(&long)
            .read(b"{\"type\":\"ping\"}\n")
            .build();

        let (mut rx, task) = spawn_line_reader(tokio::io::BufReader::new(input), 4);

        assert!(matches!(
            rx.recv().await,
            Some(Err(ProtocolError::Malformed(msg))) if msg.contains("exceeds")
        ));
        // 다음 줄은 정상적으로 읽힘
        assert_eq!(
            rx.recv().await,
            Some(Err(ProtocolError::UnknownType("ping".to_string())))
        );
        assert_eq!(rx.recv().await, None);
        task.await.unwrap();
    }
}
