//! CDC 세션 엔진 - 제어 루프
//!
//! 상태 전이:
//! 1. AwaitingConnect: 시작 상태. `connect` 명령을 기다림 (연결 타임아웃 동작)
//! 2. Active: 세션 하나가 살아 있음. 변경/에러/로그를 리포트로 내보냄
//! 3. Closed: 입력 종료, 종료 신호, 연결 타임아웃, 출력 실패 후의 최종 상태
//!
//! 모든 이벤트 소스(입력, 세션, 타이머, 종료 신호)는 하나의 `select!`에서 기다립니다.

use crate::error::{CdcError, Result};
use crate::handles::{SessionArena, SessionHandle};
use crate::protocol::{ConnectConfig, ControlMessage, Inbound, Report, ReportSink};
use crate::session::{Session, SessionEvent};
use crate::source::SourceFactory;
use std::env;
use std::future::{pending, Future};
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// CDC 엔진 설정
#[derive(Debug, Clone)]
pub struct CdcConfig {
    /// 첫 `connect`를 기다리는 시간
    pub connect_timeout: Duration,
    /// 소스 연결 + head 위치 조회 제한 시간
    pub open_timeout: Duration,
    /// 세션 종료 대기 제한 시간
    pub close_timeout: Duration,
    pub change_capacity: usize,
    pub log_capacity: usize,
    /// `connect`에 serverId가 없을 때 쓰는 복제 server id
    pub server_id: u32,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            connect_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            change_capacity: 1024,
            log_capacity: 256,
            server_id: default_server_id(),
        }
    }
}

impl CdcConfig {
    /// 환경 변수로 기본값 덮어쓰기
    pub fn from_env() -> Self {
        let defaults = CdcConfig::default();
        CdcConfig {
            connect_timeout: env_secs("BINLOG_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            open_timeout: env_secs("BINLOG_OPEN_TIMEOUT_SECS", defaults.open_timeout),
            close_timeout: env_secs("BINLOG_CLOSE_TIMEOUT_SECS", defaults.close_timeout),
            change_capacity: defaults.change_capacity,
            log_capacity: env_parse("BINLOG_LOG_CAPACITY", defaults.log_capacity).max(1),
            server_id: env_parse("BINLOG_SERVER_ID", defaults.server_id),
        }
    }
}

/// 프로세스마다 다른 server id (1001..=11000)
fn default_server_id() -> u32 {
    1001 + std::process::id() % 10_000
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}

/// 엔진 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    AwaitingConnect,
    Active,
    Closed,
}

enum Step {
    Input(Option<Inbound>),
    Session(Option<SessionEvent>),
    ConnectTimeout,
    Shutdown,
}

/// CDC 세션 엔진
pub struct CdcEngine<F, W> {
    config: CdcConfig,
    factory: F,
    sink: ReportSink<W>,
    sessions: SessionArena<Session>,
    active: Option<SessionHandle>,
    state: EngineState,
}

impl<F: SourceFactory, W: Write> CdcEngine<F, W> {
    pub fn new(config: CdcConfig, factory: F, sink: ReportSink<W>) -> Self {
        CdcEngine {
            config,
            factory,
            sink,
            sessions: SessionArena::new(),
            active: None,
            state: EngineState::AwaitingConnect,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// 제어 루프 실행
    ///
    /// 입력이 끝나거나 `shutdown`이 완료되거나 연결 타임아웃이 나면 살아 있는 세션을
    /// 닫고 돌아옵니다. 출력 쓰기 실패는 치명적이며 에러로 돌아옵니다.
    pub async fn run<S>(&mut self, mut input: mpsc::Receiver<Inbound>, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        info!(
            "Awaiting connect command (timeout {:?})",
            self.config.connect_timeout
        );
        tokio::pin!(shutdown);
        let connect_deadline = tokio::time::sleep(self.config.connect_timeout);
        tokio::pin!(connect_deadline);
        // 첫 연결 성공 시 해제되고 다시 걸리지 않음
        let mut deadline_armed = true;

        let result = loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                _ = &mut connect_deadline, if deadline_armed => Step::ConnectTimeout,
                inbound = input.recv() => Step::Input(inbound),
                event = next_session_event(&mut self.sessions, self.active) => Step::Session(event),
            };

            if let Step::Shutdown = step {
                info!("Shutdown signal received");
                break Ok(());
            }

            // 연결 중에도 종료 신호를 받음
            let handled = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received while handling input");
                    Ok(false)
                }
                handled = self.handle(step, &mut deadline_armed) => handled,
            };

            match handled {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = &result {
            warn!("Control loop stopped: {}", e);
        }
        input.close();
        self.discard_session().await;
        self.state = EngineState::Closed;
        info!("CDC engine closed");
        result
    }

    /// 한 단계 처리. `false`면 루프 종료
    async fn handle(&mut self, step: Step, deadline_armed: &mut bool) -> Result<bool> {
        match step {
            Step::Shutdown => Ok(false),
            Step::ConnectTimeout => {
                warn!("No connect command within {:?}", self.config.connect_timeout);
                let err = CdcError::Timeout(format!(
                    "no connect command received within {:?}",
                    self.config.connect_timeout
                ));
                self.sink.emit(&Report::error(&err))?;
                Ok(false)
            }
            Step::Input(None) => {
                info!("Control input closed");
                Ok(false)
            }
            Step::Input(Some(Err(protocol))) => {
                debug!("Rejected control message: {}", protocol);
                self.sink.emit(&Report::error(&CdcError::from(protocol)))?;
                Ok(true)
            }
            Step::Input(Some(Ok(ControlMessage::Connect(config)))) => {
                if self.connect(config).await? {
                    *deadline_armed = false;
                }
                Ok(true)
            }
            Step::Session(Some(event)) => {
                self.forward(event)?;
                Ok(true)
            }
            Step::Session(None) => {
                warn!("Replication session ended");
                self.discard_session().await;
                self.state = EngineState::AwaitingConnect;
                Ok(true)
            }
        }
    }

    /// `connect` 처리. 기존 세션은 먼저 닫고, 새 세션을 한 번만 시도
    ///
    /// 성공 여부를 돌려줍니다.
    async fn connect(&mut self, config: ConnectConfig) -> Result<bool> {
        if self.active.is_some() {
            info!("Replacing active session");
            self.discard_session().await;
        }
        self.state = EngineState::AwaitingConnect;

        let from = config.binlog_position.clone();
        let attempt = match config.source_config(self.config.server_id) {
            Ok(source_config) => {
                Session::connect(&self.factory, source_config, from, &self.config).await
            }
            Err(e) => Err(e),
        };

        match attempt {
            Ok(session) => {
                info!(
                    "Connected to {}:{}, streaming from {}",
                    config.hostname,
                    config.port,
                    session.start_position()
                );
                let handle = self.sessions.allocate(session);
                debug!("Session {} allocated", handle);
                self.active = Some(handle);
                self.state = EngineState::Active;
                self.sink.emit(&Report::ConnectOk)?;
                Ok(true)
            }
            Err(e) => {
                warn!("Connect to {}:{} failed: {}", config.hostname, config.port, e);
                self.sink.emit(&Report::connect_error(&e))?;
                Ok(false)
            }
        }
    }

    fn forward(&self, event: SessionEvent) -> Result<()> {
        let report = match event {
            SessionEvent::Change(event) => Report::BinlogChange { event },
            SessionEvent::Error(err) => Report::error(&err),
            SessionEvent::Log(message) => Report::Log { message },
            SessionEvent::LogsDropped(count) => Report::Log {
                message: format!("dropped {} log lines", count),
            },
        };
        self.sink.emit(&report)
    }

    async fn discard_session(&mut self) {
        let Some(handle) = self.active.take() else {
            return;
        };
        match self.sessions.free(handle) {
            Ok(mut session) => {
                session.close().await;
                debug!("Session {} freed", handle);
            }
            Err(e) => warn!("Failed to free session: {}", e),
        }
    }
}

async fn next_session_event(
    sessions: &mut SessionArena<Session>,
    active: Option<SessionHandle>,
) -> Option<SessionEvent> {
    match active.and_then(|handle| sessions.get_mut(handle).ok()) {
        Some(session) => session.next().await,
        None => pending().await,
    }
}
