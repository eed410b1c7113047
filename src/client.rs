use anyhow::Context;
use clap::Parser;
use clap::error::ErrorKind;
use icb_client::config::{Cli, Config};
use icb_client::event_loop::Client;
use icb_client::logging::init;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};

/// 启动阶段失败
const EXIT_SETUP: u8 = 1;
/// 运行中出现协议或 I/O 错误
const EXIT_FAILURE: u8 = 2;

fn setup(cli: &Cli) -> anyhow::Result<Client> {
    let config = Config::from_cli(cli).context("参数无效")?;
    info!(
        "icb {}: {}@{}:{} 房间 {}",
        icb_client::VERSION,
        config.nick,
        config.host,
        config.port,
        config.room
    );

    let exit_flag = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGHUP] {
        signal_hook::flag::register(signal, Arc::clone(&exit_flag)).context("无法注册信号处理")?;
    }
    let info_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGUSR1, Arc::clone(&info_flag)).context("无法注册信号处理")?;

    let client = Client::connect(&config, exit_flag)
        .with_context(|| format!("无法连接到 {}:{}", config.host, config.port))?;
    Ok(client.with_info_flag(info_flag))
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_SETUP);
        }
    };

    // 日志系统初始化
    init(cli.debug);

    let mut client = match setup(&cli) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("icb: {e:#}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    match client.run() {
        Ok(reason) if reason.is_failure() => {
            error!("会话异常结束: {:?}", reason);
            ExitCode::from(EXIT_FAILURE)
        }
        Ok(reason) => {
            info!("会话结束: {:?}", reason);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("icb: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
