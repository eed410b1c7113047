//! ICB 消息类型
//!
//! 每个逻辑消息以一个 ASCII 类型字节开头，字段之间用 `\x01` 分隔。

use std::borrow::Cow;
use std::fmt;

/// 字段分隔符
pub const FIELD_SEPARATOR: u8 = 0x01;

/// 已知的消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// 'a' 登录（客户端发送登录请求，服务器回复登录成功）
    Login,
    /// 'b' 公开消息
    Open,
    /// 'c' 私聊消息
    Personal,
    /// 'd' 状态消息
    Status,
    /// 'e' 错误
    Error,
    /// 'f' 重要消息
    Important,
    /// 'g' 服务器道别
    Exit,
    /// 'h' 客户端命令
    Command,
    /// 'i' 命令输出
    CommandOutput,
    /// 'j' 协议握手
    Protocol,
    /// 'k' 蜂鸣
    Beep,
    /// 'l' 保活探测
    Ping,
    /// 'm' 保活回应
    Pong,
    /// 'n' 空操作
    NoOp,
    Unknown(u8),
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            MessageKind::Login => b'a',
            MessageKind::Open => b'b',
            MessageKind::Personal => b'c',
            MessageKind::Status => b'd',
            MessageKind::Error => b'e',
            MessageKind::Important => b'f',
            MessageKind::Exit => b'g',
            MessageKind::Command => b'h',
            MessageKind::CommandOutput => b'i',
            MessageKind::Protocol => b'j',
            MessageKind::Beep => b'k',
            MessageKind::Ping => b'l',
            MessageKind::Pong => b'm',
            MessageKind::NoOp => b'n',
            MessageKind::Unknown(code) => code,
        }
    }
}

impl From<u8> for MessageKind {
    fn from(code: u8) -> Self {
        match code {
            b'a' => MessageKind::Login,
            b'b' => MessageKind::Open,
            b'c' => MessageKind::Personal,
            b'd' => MessageKind::Status,
            b'e' => MessageKind::Error,
            b'f' => MessageKind::Important,
            b'g' => MessageKind::Exit,
            b'h' => MessageKind::Command,
            b'i' => MessageKind::CommandOutput,
            b'j' => MessageKind::Protocol,
            b'k' => MessageKind::Beep,
            b'l' => MessageKind::Ping,
            b'm' => MessageKind::Pong,
            b'n' => MessageKind::NoOp,
            other => MessageKind::Unknown(other),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code() as char)
    }
}

/// 一个完整的逻辑消息（已经去掉长度字节和结尾 NUL）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcbMessage {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl IcbMessage {
    pub fn new(kind: MessageKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.code(),
            data: data.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self.kind)
    }

    /// 整个数据区作为文本（非法 UTF-8 以替换字符显示）
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}
