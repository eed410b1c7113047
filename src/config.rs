//! 命令行参数与运行配置

use crate::framing::{Encoding, NICKNAME_MAX};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;
use url::{Host, Url};

/// ICB 默认端口
pub const DEFAULT_PORT: u16 = 7326;

/// 默认空闲间隔（秒）
pub const DEFAULT_IDLE_SECS: u64 = 30;

/// ICB 聊天终端客户端
#[derive(Parser, Debug, Clone)]
#[command(name = "icb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// 提高诊断输出级别（可重复）
    #[arg(short = 'd', action = ArgAction::Count)]
    pub debug: u8,

    /// 不保存聊天记录
    #[arg(short = 'H')]
    pub no_history: bool,

    /// 使用未经验证的扩展多包编码
    #[arg(short = 'x')]
    pub extended: bool,

    /// 空闲保活间隔，0 表示关闭
    #[arg(short = 't', value_name = "SECS", default_value_t = DEFAULT_IDLE_SECS)]
    pub timeout: u64,

    /// 服务器地址 [nick@]host[:port]
    #[arg(value_name = "[NICK@]HOST[:PORT]")]
    pub server: String,

    /// 要进入的房间
    pub room: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("无效的服务器地址 '{0}'")]
    InvalidServer(String),

    #[error("服务器地址解析失败: {0}")]
    Url(#[from] url::ParseError),

    #[error("无法确定昵称，请使用 nick@host 形式或设置 USER")]
    MissingNick,

    #[error("昵称过长: {length} 字节 (必须小于 {max})")]
    NickTooLong { length: usize, max: usize },

    #[error("房间名不能为空")]
    EmptyRoom,
}

/// 解析后的服务器地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub nick: Option<String>,
    pub host: String,
    pub port: u16,
}

/// 解析 `[nick@]host[:port]`，IPv6 地址写成 `[addr]:port`
pub fn parse_server(spec: &str) -> Result<ServerAddress, ConfigError> {
    let (nick, host_part) = match spec.split_once('@') {
        Some((nick, rest)) => (Some(nick.to_string()), rest),
        None => (None, spec),
    };
    if host_part.is_empty() {
        return Err(ConfigError::InvalidServer(spec.to_string()));
    }

    let url = Url::parse(&format!("icb://{host_part}"))?;
    if !url.username().is_empty()
        || url.password().is_some()
        || !url.path().is_empty()
        || url.query().is_some()
        || url.fragment().is_some()
    {
        return Err(ConfigError::InvalidServer(spec.to_string()));
    }

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => return Err(ConfigError::InvalidServer(spec.to_string())),
    };

    Ok(ServerAddress {
        nick,
        host,
        port: url.port().unwrap_or(DEFAULT_PORT),
    })
}

/// 运行配置，启动后不再改变
#[derive(Debug, Clone)]
pub struct Config {
    pub nick: String,
    pub host: String,
    pub port: u16,
    pub room: String,
    /// 0 表示关闭保活和超时
    pub idle_interval: Duration,
    /// `None` 表示不保存聊天记录
    pub history_dir: Option<PathBuf>,
    pub encoding: Encoding,
    pub verbosity: u8,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        Self::from_cli_with(cli, default_nick, dirs::home_dir)
    }

    /// 昵称和主目录的来源可替换，便于测试
    pub fn from_cli_with(
        cli: &Cli,
        nick_source: impl FnOnce() -> Option<String>,
        home_source: impl FnOnce() -> Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let server = parse_server(&cli.server)?;

        let nick = server
            .nick
            .or_else(nick_source)
            .filter(|nick| !nick.is_empty())
            .ok_or(ConfigError::MissingNick)?;
        if nick.len() >= NICKNAME_MAX {
            return Err(ConfigError::NickTooLong {
                length: nick.len(),
                max: NICKNAME_MAX,
            });
        }

        if cli.room.is_empty() {
            return Err(ConfigError::EmptyRoom);
        }

        let history_dir = if cli.no_history {
            None
        } else {
            home_source().map(|home| home.join(".icb").join("logs").join(&server.host))
        };

        Ok(Self {
            nick,
            host: server.host,
            port: server.port,
            room: cli.room.clone(),
            idle_interval: Duration::from_secs(cli.timeout),
            history_dir,
            encoding: if cli.extended { Encoding::Extended } else { Encoding::Standard },
            verbosity: cli.debug,
        })
    }
}

/// 登录名：先 USER，再 LOGNAME
fn default_nick() -> Option<String> {
    std::env::var("USER")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("LOGNAME").ok())
}
