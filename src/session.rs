//! 복제 세션
//!
//! 복제 소스 하나를 세 개의 독립 채널(변경 이벤트, 에러, 로그)에 묶고
//! 그 종료를 책임집니다.
//!
//! ```text
//! ReplicationSource ──rows──▶ normalize ──┬─▶ changes
//!        │                                └─▶ errors ◀── 소스 종료 에러
//!        └──────────logs (drop-oldest)──────▶ logs
//! ```

use crate::cdc_engine::CdcConfig;
use crate::error::{CdcError, Result};
use crate::events::{ChangeEvent, RowsNotification};
use crate::normalizer::normalize;
use crate::offset::BinlogPosition;
use crate::source::{ReplicationSource, SourceConfig, SourceFactory, SourceOutput};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 세션에서 나오는 항목
#[derive(Debug)]
pub enum SessionEvent {
    Change(ChangeEvent),
    Error(CdcError),
    Log(String),
    /// 로그 채널이 가득 차서 버려진 라인 수
    LogsDropped(u64),
}

/// 복제 세션
pub struct Session {
    start: BinlogPosition,
    changes: mpsc::Receiver<ChangeEvent>,
    errors: mpsc::Receiver<CdcError>,
    logs: broadcast::Receiver<String>,
    logs_open: bool,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

enum Polled {
    Event(SessionEvent),
    Log(std::result::Result<String, RecvError>),
}

impl Session {
    /// 소스를 열고 스트리밍을 시작
    ///
    /// `from`이 없으면 소스의 현재 head부터 따라갑니다.
    /// 연결 실패는 여기서 바로 에러로 돌아오고, 성공하면 스트리밍은 백그라운드에서 진행됩니다.
    pub async fn connect<F: SourceFactory>(
        factory: &F,
        source_config: SourceConfig,
        from: Option<BinlogPosition>,
        config: &CdcConfig,
    ) -> Result<Session> {
        let opening = async {
            let mut source = factory.open(source_config).await?;
            let from = match from {
                Some(position) => position,
                None => source.current_position().await?,
            };
            Ok::<_, CdcError>((source, from))
        };
        let (source, from) = tokio::time::timeout(config.open_timeout, opening)
            .await
            .map_err(|_| {
                CdcError::Timeout(format!(
                    "replication source did not open within {:?}",
                    config.open_timeout
                ))
            })??;

        let capacity = config.change_capacity.max(1);
        let (rows_tx, rows_rx) = mpsc::channel(capacity);
        let (changes_tx, changes_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);
        let (logs_tx, logs_rx) = broadcast::channel(config.log_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let output = SourceOutput {
            rows: rows_tx,
            logs: logs_tx,
            stop: stop_rx,
        };

        info!("Replication session starting from {}", from);
        let stream = source.stream(from.clone(), output);
        let task = tokio::spawn(supervise(stream, rows_rx, changes_tx, errors_tx));

        Ok(Session {
            start: from,
            changes: changes_rx,
            errors: errors_rx,
            logs: logs_rx,
            logs_open: true,
            stop: stop_tx,
            task: Some(task),
            close_timeout: config.close_timeout,
        })
    }

    /// 스트리밍 시작 위치
    pub fn start_position(&self) -> &BinlogPosition {
        &self.start
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// 먼저 준비된 채널의 다음 항목
    ///
    /// 세 채널이 모두 닫히면 `None` (소스가 끝났음을 의미).
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            let polled = tokio::select! {
                Some(event) = self.changes.recv() => Polled::Event(SessionEvent::Change(event)),
                Some(err) = self.errors.recv() => Polled::Event(SessionEvent::Error(err)),
                line = self.logs.recv(), if self.logs_open => Polled::Log(line),
                else => return None,
            };

            match polled {
                Polled::Event(event) => return Some(event),
                Polled::Log(Ok(line)) => return Some(SessionEvent::Log(line)),
                Polled::Log(Err(RecvError::Lagged(dropped))) => {
                    return Some(SessionEvent::LogsDropped(dropped))
                }
                Polled::Log(Err(RecvError::Closed)) => self.logs_open = false,
            }
        }
    }

    /// 소스를 멈추고 채널을 닫음
    ///
    /// 두 번째 호출부터는 아무 일도 하지 않습니다.
    /// 소스가 `close_timeout` 안에 끝나지 않으면 백그라운드 작업을 중단시킵니다.
    pub async fn close(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        // 수신자가 이미 사라졌으면 무시
        let _ = self.stop.send(true);
        self.changes.close();
        self.errors.close();
        self.logs_open = false;

        match tokio::time::timeout(self.close_timeout, &mut task).await {
            Ok(Ok(())) => debug!("Replication session from {} closed", self.start),
            Ok(Err(e)) => warn!("Replication session task failed: {}", e),
            Err(_) => {
                warn!(
                    "Replication source did not stop within {:?}, aborting",
                    self.close_timeout
                );
                task.abort();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.stop.send(true);
            task.abort();
        }
    }
}

/// 소스 스트리밍과 정규화를 함께 진행
///
/// 소스가 에러로 끝나면 그 에러를 에러 채널의 마지막 항목으로 보냅니다.
async fn supervise(
    stream: impl Future<Output = Result<()>>,
    mut rows: mpsc::Receiver<RowsNotification>,
    changes: mpsc::Sender<ChangeEvent>,
    errors: mpsc::Sender<CdcError>,
) {
    let normalize_errors = errors.clone();
    let forward = async move {
        while let Some(notification) = rows.recv().await {
            for result in normalize(notification) {
                let delivered = match result {
                    Ok(event) => changes.send(event).await.is_ok(),
                    Err(err) => {
                        debug!("Dropping undecodable row: {}", err);
                        normalize_errors.send(err.into()).await.is_ok()
                    }
                };
                // 세션이 닫힘. rows 수신자를 버려 소스도 멈추게 함
                if !delivered {
                    return;
                }
            }
        }
    };

    let (result, ()) = tokio::join!(stream, forward);
    match result {
        Ok(()) => debug!("Replication source finished"),
        Err(err) => {
            warn!("Replication source terminated: {}", err);
            let _ = errors.send(err).await;
        }
    }
}
