//! ICB 聊天客户端核心库

/// 消息类型
pub mod message;

/// 分帧（数据包编码与重组）
pub mod framing;

/// 输出队列
pub mod queue;

/// 会话状态机
pub mod session;

/// 聊天记录
pub mod history;

/// 终端显示
pub mod display;

/// 用户输入
pub mod input;

/// 命令行与配置
pub mod config;

pub mod fd;
pub mod keepalive;
pub mod watch;

/// 事件循环
pub mod event_loop;

/// 重新导出常用类型
pub use config::{Cli, Config};
pub use event_loop::{Client, ClientError, ClientStats};
pub use framing::{Encoding, FramingError, PacketEncoder, PacketReader};
pub use message::{IcbMessage, MessageKind};
pub use queue::{OutboundTask, OutputQueue};
pub use session::{Effect, ExitReason, ProtocolError, Session, SessionState};

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 日志系统
pub mod logging;
