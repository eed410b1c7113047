//! 用户输入 - 行分类与非阻塞标准输入行缓冲

use crate::message::FIELD_SEPARATOR;
use std::collections::VecDeque;
use std::io::{self, Read};
use tracing::trace;

/// 行缓冲上限，超过后按一行处理
const MAX_LINE: usize = 64 * 1024;

/// 一行用户输入的解释结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    /// 公开消息
    Public(String),
    /// `/m` 或 `/msg` 私聊；`payload` 是要发送的命令数据
    Private {
        peer: String,
        text: String,
        payload: Vec<u8>,
    },
    /// 其它客户端命令
    Command { name: String, payload: Vec<u8> },
}

/// 解释一行输入，空白行返回 `None`
///
/// `/` 后紧跟非空白字符的行是命令：命令名到下一个空白为止，
/// 若有参数则命令名后的那个空白替换成 `\x01`。
pub fn classify_line(line: &str) -> Option<UserInput> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let Some(body) = line.strip_prefix('/').filter(|b| b.starts_with(|c: char| !c.is_whitespace())) else {
        return Some(UserInput::Public(line.to_string()));
    };

    let (name, args) = match body.find(char::is_whitespace) {
        Some(pos) => {
            let sep_len = body[pos..].chars().next().map_or(1, char::len_utf8);
            (&body[..pos], Some(&body[pos + sep_len..]))
        }
        None => (body, None),
    };

    let mut payload = name.as_bytes().to_vec();
    if let Some(args) = args {
        payload.push(FIELD_SEPARATOR);
        payload.extend_from_slice(args.as_bytes());
    }

    if name == "m" || name == "msg" {
        let args = args.unwrap_or("").trim_start();
        let (peer, text) = match args.find(char::is_whitespace) {
            Some(pos) => (&args[..pos], args[pos..].trim_start()),
            None => (args, ""),
        };
        if peer.is_empty() || text.is_empty() {
            trace!("私聊命令缺少昵称或内容，忽略");
            return None;
        }
        return Some(UserInput::Private {
            peer: peer.to_string(),
            text: text.to_string(),
            payload,
        });
    }

    Some(UserInput::Command {
        name: name.to_string(),
        payload,
    })
}

/// 从非阻塞来源积累字节并切分成行
#[derive(Debug, Default)]
pub struct StdinLines {
    partial: Vec<u8>,
    lines: VecDeque<String>,
    closed: bool,
}

impl StdinLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取当前所有可读字节；EOF 时剩余的半行作为最后一行
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; 1024];
        let mut total = 0;
        loop {
            match source.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    if !self.partial.is_empty() {
                        let rest = std::mem::take(&mut self.partial);
                        self.lines.push_back(String::from_utf8_lossy(&rest).into_owned());
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    self.absorb(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn absorb(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' || self.partial.len() >= MAX_LINE {
                let line = std::mem::take(&mut self.partial);
                self.lines.push_back(String::from_utf8_lossy(&line).into_owned());
                if b == b'\n' {
                    continue;
                }
            }
            self.partial.push(b);
        }
    }

    pub fn next_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    pub fn has_pending_line(&self) -> bool {
        !self.lines.is_empty()
    }

    /// 来源已关闭且所有行都已取走
    pub fn is_closed(&self) -> bool {
        self.closed && self.lines.is_empty()
    }
}
