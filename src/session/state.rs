//! 会话阶段与服务器特性标志

use std::fmt;
use std::ops::BitOr;

/// 协议阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP 连接尚未建立
    Connecting,
    /// 已连接，等待服务器协议握手
    Connected,
    /// 已发送登录请求
    LoginSent,
    /// 正常聊天
    Chat,
    /// 已发送命令，等待多段命令输出
    CommandSent,
}

impl SessionState {
    /// 是否处于可以收发聊天消息的阶段
    pub fn is_chatting(self) -> bool {
        matches!(self, SessionState::Chat | SessionState::CommandSent)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::LoginSent => "login-sent",
            SessionState::Chat => "chat",
            SessionState::CommandSent => "command-sent",
        };
        f.write_str(name)
    }
}

/// 服务器特性标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureSet(u8);

impl FeatureSet {
    pub const EMPTY: FeatureSet = FeatureSet(0);
    /// 服务器支持 ping/pong 保活
    pub const PING: FeatureSet = FeatureSet(0x01);
    /// 使用扩展多包编码
    pub const EXT_PKT: FeatureSet = FeatureSet(0x02);

    pub fn contains(self, other: FeatureSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FeatureSet) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FeatureSet) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        FeatureSet::PING
    }
}

impl BitOr for FeatureSet {
    type Output = FeatureSet;

    fn bitor(self, rhs: FeatureSet) -> FeatureSet {
        FeatureSet(self.0 | rhs.0)
    }
}
