//! MySQL Binlog CDC 브리지 핵심 구현
//!
//! MySQL 바이너리 로그를 읽어 행 변경을 줄 단위 JSON으로 내보냅니다.
//! 주요 기능:
//! - 표준 입력 제어 프로토콜 (`connect`)
//! - ENUM/SET 컬럼 정규화
//! - 복제 세션 수명 관리 및 종료
//! - 변경/에러/로그 리포트를 한 줄씩 표준 출력으로

pub mod binlog_client;
pub mod cdc_engine;
pub mod connection;
pub mod error;
pub mod events;
pub mod handles;
pub mod normalizer;
pub mod offset;
pub mod protocol;
pub mod session;
pub mod source;

pub use binlog_client::{BinlogClient, MySqlSourceFactory};
pub use cdc_engine::{CdcConfig, CdcEngine, EngineState};
pub use connection::MySqlConnection;
pub use error::{CdcError, DecodeError, ProtocolError, Result};
pub use events::{ChangeEvent, ColumnMetadata, RowChange, TableRef};
pub use offset::BinlogPosition;
pub use protocol::{ControlMessage, Report, ReportSink};
pub use session::{Session, SessionEvent};
