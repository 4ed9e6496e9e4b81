//! 복제 소스 capability 인터페이스
//!
//! 브리지가 복제 클라이언트에게 요구하는 것은 다음뿐입니다:
//! - 연결 (인증 실패는 여기서 동기적으로 보고)
//! - 현재 head 위치 조회
//! - 주어진 위치부터 스트리밍 (행 변경 알림과 로그 라인을 채널로 전달)
//! - 중지 신호에 따른 종료
//!
//! 이벤트 종류별 콜백 대신 데이터 흐름(채널)으로만 계약합니다.

use crate::error::Result;
use crate::events::{RowsNotification, TableRef};
use crate::offset::BinlogPosition;
use regex::RegexSet;
use std::future::Future;
use tokio::sync::{broadcast, mpsc, watch};

/// 스트리밍할 테이블 선택 (`schema.table`에 대한 비고정 매칭)
#[derive(Debug, Clone)]
pub struct TableFilter {
    patterns: Option<RegexSet>,
}

impl TableFilter {
    /// 패턴이 비어 있으면 모든 테이블을 선택
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = RegexSet::new(patterns)?;
        Ok(TableFilter {
            patterns: if set.is_empty() { None } else { Some(set) },
        })
    }

    pub fn matches(&self, table: &TableRef) -> bool {
        match &self.patterns {
            Some(set) => set.is_match(&table.to_string()),
            None => true,
        }
    }
}

/// 복제 소스 연결 설정
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 복제 클라이언트로 사용할 server id
    pub server_id: u32,
    pub tables: TableFilter,
}

/// 스트리밍 중인 소스의 출력 채널과 중지 신호
pub struct SourceOutput {
    pub rows: mpsc::Sender<RowsNotification>,
    pub logs: broadcast::Sender<String>,
    pub stop: watch::Receiver<bool>,
}

impl SourceOutput {
    /// 진단 로그 라인 전달 (가득 차면 가장 오래된 라인이 밀려남)
    pub fn log(&self, message: impl Into<String>) {
        // 수신자가 없으면 버림
        let _ = self.logs.send(message.into());
    }

    /// 중지 요청이 오거나 세션이 사라질 때까지 대기
    pub async fn stopped(&mut self) {
        while !*self.stop.borrow_and_update() {
            if self.stop.changed().await.is_err() {
                return;
            }
        }
    }
}

/// 복제 소스 생성기
pub trait SourceFactory: Send + Sync + 'static {
    type Source: ReplicationSource;

    /// 소스에 연결 (연결/인증 실패는 여기서 에러)
    fn open(&self, config: SourceConfig) -> impl Future<Output = Result<Self::Source>> + Send;
}

/// 연결된 복제 소스
pub trait ReplicationSource: Send + 'static {
    /// 현재 head 위치
    fn current_position(&mut self) -> impl Future<Output = Result<BinlogPosition>> + Send;

    /// `from`부터 스트리밍
    ///
    /// 중지 요청 시 `Ok(())`로 끝나야 하고, 내부 치명적 에러는 `Err`로 돌려줍니다.
    /// 반환되면 행 채널이 닫힙니다.
    fn stream(
        self,
        from: BinlogPosition,
        output: SourceOutput,
    ) -> impl Future<Output = Result<()>> + Send + 'static;
}

#[cfg(test)]
pub mod mock {
    //! 데이터베이스 없이 세션/엔진을 검증하기 위한 스크립트형 소스

    use super::*;
    use crate::error::CdcError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub enum MockItem {
        Rows(RowsNotification),
        Log(String),
        /// 스트림이 내부 에러로 종료
        Fail(String),
    }

    /// 열린 소스 하나를 테스트에서 조종하는 핸들
    #[derive(Clone)]
    pub struct MockController {
        pub config: SourceConfig,
        items: mpsc::UnboundedSender<MockItem>,
        started_from: Arc<Mutex<Option<BinlogPosition>>>,
        stopped: Arc<AtomicBool>,
    }

    impl MockController {
        pub fn push(&self, item: MockItem) {
            let _ = self.items.send(item);
        }

        pub fn started_from(&self) -> Option<BinlogPosition> {
            self.started_from.lock().clone()
        }

        pub fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct MockState {
        open_failures: VecDeque<String>,
        hang_next_open: bool,
        opened: Vec<MockController>,
    }

    #[derive(Clone)]
    pub struct MockFactory {
        head: BinlogPosition,
        state: Arc<Mutex<MockState>>,
    }

    impl MockFactory {
        pub fn new() -> Self {
            MockFactory {
                head: BinlogPosition::new("mysql-bin.000007", 157),
                state: Arc::new(Mutex::new(MockState::default())),
            }
        }

        pub fn head(&self) -> BinlogPosition {
            self.head.clone()
        }

        /// 다음 open 호출을 실패시킴
        pub fn fail_next_open(&self, message: &str) {
            self.state.lock().open_failures.push_back(message.to_string());
        }

        /// 다음 open 호출이 끝나지 않게 함
        pub fn hang_next_open(&self) {
            self.state.lock().hang_next_open = true;
        }

        pub fn opened(&self) -> Vec<MockController> {
            self.state.lock().opened.clone()
        }
    }

    pub struct MockSource {
        head: BinlogPosition,
        items: mpsc::UnboundedReceiver<MockItem>,
        started_from: Arc<Mutex<Option<BinlogPosition>>>,
        stopped: Arc<AtomicBool>,
    }

    impl SourceFactory for MockFactory {
        type Source = MockSource;

        async fn open(&self, config: SourceConfig) -> Result<MockSource> {
            let hang = {
                let mut state = self.state.lock();
                if let Some(message) = state.open_failures.pop_front() {
                    return Err(CdcError::ConnectionError(message));
                }
                std::mem::take(&mut state.hang_next_open)
            };
            if hang {
                std::future::pending::<()>().await;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let controller = MockController {
                config,
                items: tx,
                started_from: Arc::new(Mutex::new(None)),
                stopped: Arc::new(AtomicBool::new(false)),
            };
            let source = MockSource {
                head: self.head.clone(),
                items: rx,
                started_from: controller.started_from.clone(),
                stopped: controller.stopped.clone(),
            };
            self.state.lock().opened.push(controller);
            Ok(source)
        }
    }

    impl ReplicationSource for MockSource {
        async fn current_position(&mut self) -> Result<BinlogPosition> {
            Ok(self.head.clone())
        }

        fn stream(
            mut self,
            from: BinlogPosition,
            mut output: SourceOutput,
        ) -> impl Future<Output = Result<()>> + Send + 'static {
            async move {
                *self.started_from.lock() = Some(from);
                loop {
                    tokio::select! {
                        _ = output.stopped() => {
                            self.stopped.store(true, Ordering::SeqCst);
                            return Ok(());
                        }
                        item = self.items.recv() => match item {
                            Some(MockItem::Rows(rows)) => {
                                if output.rows.send(rows).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Some(MockItem::Log(line)) => output.log(line),
                            Some(MockItem::Fail(message)) => {
                                return Err(CdcError::StreamError(message));
                            }
                            None => {
                                output.stopped().await;
                                self.stopped.store(true, Ordering::SeqCst);
                                return Ok(());
                            }
                        },
                    }
                }
            }
        }
    }
}
