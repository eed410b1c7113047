//! 会话状态机 - 按当前协议阶段解释服务器消息和用户输入
//!
//! 状态机本身不做任何 I/O，只返回一组 [`Effect`] 交给事件循环执行。

mod render;
mod state;

pub use state::{FeatureSet, SessionState};

use crate::display::Render;
use crate::framing::Encoding;
use crate::history::LogEntry;
use crate::input::{UserInput, classify_line};
use crate::message::{FIELD_SEPARATOR, IcbMessage, MessageKind};
use chrono::{DateTime, Local};
use tracing::{debug, info, trace};

/// 服务器不支持 ping 时返回的错误文本
const PING_UNSUPPORTED: &str = "Undefined message type 108";

/// 协议错误，全部是致命错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("在 {state} 阶段收到意外的消息类型 '{kind}'")]
    UnexpectedMessage { kind: char, state: SessionState },

    #[error("收到无效的 '{kind}' 类型消息: {reason}")]
    InvalidMessage { kind: char, reason: &'static str },

    #[error("不支持的协议版本: {0}")]
    UnsupportedVersion(String),
}

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// 服务器发送了 'g'
    ServerFarewell,
    /// 非聊天阶段收到服务器错误
    ServerError,
    /// 服务器关闭了连接
    ConnectionClosed,
    /// 标准输入结束
    InputClosed,
    /// 收到退出信号
    Interrupted,
    /// 服务器长时间无响应
    Timeout,
}

impl ExitReason {
    /// 是否应以失败状态退出
    pub fn is_failure(self) -> bool {
        matches!(self, ExitReason::ServerError | ExitReason::Timeout)
    }
}

/// 状态机的输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// 发送给服务器
    Transmit(IcbMessage),
    /// 显示到终端
    Render(Render),
    /// 写入聊天记录
    Log(LogEntry),
    /// 结束会话
    Exit(ExitReason),
}

/// 本端身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub nick: String,
    pub room: String,
    /// 服务器主机名，服务器错误以它为作者显示
    pub host: String,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    features: FeatureSet,
    identity: Identity,
    /// 当前命令已收到的输出行数
    command_results: usize,
}

impl Session {
    pub fn new(identity: Identity, features: FeatureSet) -> Self {
        Self {
            state: SessionState::Connecting,
            features,
            identity,
            command_results: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// 发送方向使用的编码
    pub fn encoding(&self) -> Encoding {
        if self.features.contains(FeatureSet::EXT_PKT) {
            Encoding::Extended
        } else {
            Encoding::Standard
        }
    }

    /// 保活探测消息：支持 ping 时发 'l'，否则发 'n'
    pub fn keepalive_message(&self) -> IcbMessage {
        if self.features.contains(FeatureSet::PING) {
            IcbMessage::new(MessageKind::Ping, Vec::new())
        } else {
            IcbMessage::new(MessageKind::NoOp, Vec::new())
        }
    }

    /// TCP 连接建立
    pub fn on_connected(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Connecting {
            debug!("连接完成通知重复出现，忽略");
            return Vec::new();
        }
        self.state = SessionState::Connected;
        info!("已连接到 {}", self.identity.host);
        vec![Effect::Render(Render::trusted("connected\n"))]
    }

    pub fn handle_message(&mut self, msg: &IcbMessage) -> Result<Vec<Effect>, ProtocolError> {
        self.handle_message_at(msg, Local::now())
    }

    /// 处理一个服务器消息，`now` 用于聊天行的时间戳
    pub fn handle_message_at(&mut self, msg: &IcbMessage, now: DateTime<Local>) -> Result<Vec<Effect>, ProtocolError> {
        let kind = msg.kind();
        trace!("阶段 {} 收到 '{}' 类型消息，{} 字节", self.state, kind, msg.data.len());

        match kind {
            MessageKind::Login => {
                self.expect_state(kind, self.state == SessionState::LoginSent)?;
                self.state = SessionState::Chat;
                info!("以 {} 身份登录房间 {}", self.identity.nick, self.identity.room);
                Ok(vec![Effect::Render(Render::Trusted(format!(
                    "Logged in to room {} as {}\n",
                    self.identity.room, self.identity.nick
                )))])
            }

            MessageKind::Open | MessageKind::Personal | MessageKind::Status | MessageKind::Important => {
                self.expect_chatting(kind)?;
                let text = msg.text();
                let Some((author, body)) = text.split_once(FIELD_SEPARATOR as char) else {
                    return Err(invalid(kind, "missing text"));
                };
                Ok(incoming_chat(msg.kind, author, Render::untrusted(body), now))
            }

            MessageKind::Error => Ok(self.handle_error(msg, now)),

            MessageKind::Exit => {
                self.expect_chatting(kind)?;
                info!("服务器结束会话");
                Ok(vec![
                    Effect::Render(Render::trusted("ICB: server said bye-bye\n")),
                    Effect::Exit(ExitReason::ServerFarewell),
                ])
            }

            MessageKind::CommandOutput => {
                self.expect_chatting(kind)?;
                self.handle_command_output(msg)
            }

            MessageKind::Protocol => {
                self.expect_state(kind, self.state == SessionState::Connected)?;
                self.handle_protocol(msg)
            }

            MessageKind::Beep => {
                self.expect_chatting(kind)?;
                Ok(incoming_chat(msg.kind, "SERVER", Render::trusted("\x07BEEP!"), now))
            }

            MessageKind::Ping => Ok(vec![Effect::Transmit(IcbMessage::new(
                MessageKind::Pong,
                msg.data.clone(),
            ))]),

            MessageKind::Pong => Ok(Vec::new()),

            MessageKind::NoOp => {
                self.expect_chatting(kind)?;
                Ok(Vec::new())
            }

            MessageKind::Command | MessageKind::Unknown(_) => {
                debug!("忽略不支持的消息类型 '{}'", kind);
                Ok(vec![Effect::Render(Render::Trusted(format!(
                    "unsupported message of type '{}', ignored\n",
                    kind
                )))])
            }
        }
    }

    /// 处理用户输入的一行
    pub fn submit_line(&mut self, line: &str) -> Vec<Effect> {
        let Some(input) = classify_line(line) else {
            return Vec::new();
        };

        match input {
            UserInput::Public(text) => vec![
                Effect::Log(LogEntry::outgoing(
                    MessageKind::Open.code(),
                    self.identity.nick.clone(),
                    text.clone(),
                )),
                Effect::Transmit(IcbMessage::new(MessageKind::Open, text)),
            ],
            UserInput::Private { peer, text, payload } => vec![
                Effect::Log(LogEntry::outgoing(MessageKind::Personal.code(), peer, text)),
                Effect::Transmit(IcbMessage::new(MessageKind::Command, payload)),
            ],
            UserInput::Command { name, payload } => {
                if self.state == SessionState::Chat {
                    self.state = SessionState::CommandSent;
                    self.command_results = 0;
                }
                debug!("发送命令 /{}", name);
                vec![Effect::Transmit(IcbMessage::new(MessageKind::Command, payload))]
            }
        }
    }

    fn handle_protocol(&mut self, msg: &IcbMessage) -> Result<Vec<Effect>, ProtocolError> {
        let text = msg.text();
        let mut fields = text.splitn(3, FIELD_SEPARATOR as char);
        let version = fields.next().unwrap_or_default();
        let host_id = fields.next().unwrap_or("HIDDEN");
        let server_id = fields.next().unwrap_or("unknown implementation");

        if version != "1" {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()));
        }
        debug!("服务器 {} ({}) 使用协议版本 {}", host_id, server_id, version);

        let Identity { nick, room, .. } = &self.identity;
        let login = format!("{nick}\x01{nick}\x01{room}\x01login\x01");
        self.state = SessionState::LoginSent;
        Ok(vec![Effect::Transmit(IcbMessage::new(MessageKind::Login, login))])
    }

    fn handle_error(&mut self, msg: &IcbMessage, now: DateTime<Local>) -> Vec<Effect> {
        let text = msg.text();
        if text == PING_UNSUPPORTED {
            self.features.remove(FeatureSet::PING);
            debug!("服务器不支持 ping，改用 no-op 保活");
            return Vec::new();
        }

        let mut effects = vec![Effect::Render(Render::trusted("\x07"))];
        effects.extend(incoming_chat(msg.kind, &self.identity.host, Render::untrusted(&*text), now));

        match self.state {
            SessionState::Chat => {}
            SessionState::CommandSent => self.state = SessionState::Chat,
            _ => effects.push(Effect::Exit(ExitReason::ServerError)),
        }
        effects
    }

    fn handle_command_output(&mut self, msg: &IcbMessage) -> Result<Vec<Effect>, ProtocolError> {
        let text = msg.text();
        let Some((output_type, body)) = text.split_once(FIELD_SEPARATOR as char) else {
            return Err(invalid(msg.kind(), "missing output type"));
        };

        let renders = match output_type {
            "co" => {
                self.command_results += 1;
                vec![Render::untrusted(body), Render::trusted("\n")]
            }
            "ec" => {
                if self.state == SessionState::CommandSent {
                    debug!("命令输出结束，共 {} 行", self.command_results);
                    self.state = SessionState::Chat;
                }
                vec![Render::untrusted(body), Render::trusted("\n")]
            }
            "wl" => render::user_list_row(body),
            "wg" => render::group_list_row(body, &self.identity.room),
            "wh" | "gh" | "ch" | "c" => Vec::new(),
            _ => return Err(invalid(msg.kind(), "unsupported output type")),
        };
        Ok(renders.into_iter().map(Effect::Render).collect())
    }

    fn expect_chatting(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        self.expect_state(kind, self.state.is_chatting())
    }

    fn expect_state(&self, kind: MessageKind, allowed: bool) -> Result<(), ProtocolError> {
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedMessage {
                kind: kind.code() as char,
                state: self.state,
            })
        }
    }
}

fn invalid(kind: MessageKind, reason: &'static str) -> ProtocolError {
    ProtocolError::InvalidMessage {
        kind: kind.code() as char,
        reason,
    }
}

/// 收到的聊天行：记录并显示
fn incoming_chat(kind: u8, author: &str, text: Render, now: DateTime<Local>) -> Vec<Effect> {
    let mut effects = vec![Effect::Log(LogEntry::incoming(kind, author, text.as_str()))];
    effects.extend(render::chat_line(kind, author, text, now).into_iter().map(Effect::Render));
    effects
}
