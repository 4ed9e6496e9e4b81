/// MySQL binlog CDC 브리지
///
/// 표준 입력으로 `connect` 명령을 받고, 행 변경을 표준 출력에 한 줄씩 JSON으로 씁니다.
/// 진단 로그는 표준 에러로 (`RUST_LOG`, 기본 `warn`).
use mysql_binlog_bridge::protocol::{spawn_line_reader, ReportSink};
use mysql_binlog_bridge::{CdcConfig, CdcEngine, MySqlSourceFactory};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // 로깅 초기화 (stdout은 프로토콜 전용)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run());
    // stdin 읽기 스레드가 블로킹 중일 수 있으므로 기다리지 않음
    runtime.shutdown_timeout(Duration::from_millis(100));
    code
}

async fn run() -> ExitCode {
    let config = CdcConfig::from_env();
    info!("Starting MySQL binlog bridge (server id {})", config.server_id);

    let (input, reader) = spawn_line_reader(BufReader::new(tokio::io::stdin()), 16);
    let sink = ReportSink::new(std::io::stdout());
    let mut engine = CdcEngine::new(config, MySqlSourceFactory, sink);

    let result = engine.run(input, shutdown_signal()).await;
    reader.abort();

    match result {
        Ok(()) => {
            info!("MySQL binlog bridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("MySQL binlog bridge failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!(signal = "SIGINT", "shutdown signal"),
                    _ = sigterm.recv() => info!(signal = "SIGTERM", "shutdown signal"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                std::future::pending::<()>().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    }
}
