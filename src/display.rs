//! 终端显示 - 可信/不可信文本分类与清洗
//!
//! 所有输出到终端的文本都经过同一个输出队列。来自服务器或其他用户的
//! 文本是不可信的，入队前先交给 [`Sanitize`] 处理。

use crate::queue::{DrainStatus, OutputQueue};
use std::borrow::Cow;
use std::io::{self, Write};

/// 送往终端的一段文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Render {
    /// 客户端自己生成的文本，原样输出
    Trusted(String),
    /// 来自网络的文本，输出前清洗
    Untrusted(String),
}

impl Render {
    pub fn trusted(text: impl Into<String>) -> Self {
        Render::Trusted(text.into())
    }

    pub fn untrusted(text: impl Into<String>) -> Self {
        Render::Untrusted(text.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Render::Trusted(text) | Render::Untrusted(text) => text,
        }
    }
}

/// 不可信文本的清洗接口
pub trait Sanitize {
    fn sanitize<'a>(&self, text: &'a str) -> Cow<'a, str>;
}

/// 默认清洗器：可打印字符原样保留，控制字符转义成 `\u{..}` 形式
#[derive(Debug, Default, Clone, Copy)]
pub struct EscapeControls;

impl Sanitize for EscapeControls {
    fn sanitize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !text.chars().any(char::is_control) {
            return Cow::Borrowed(text);
        }

        let mut escaped = String::with_capacity(text.len() + 8);
        for c in text.chars() {
            if c.is_control() {
                escaped.extend(c.escape_default());
            } else {
                escaped.push(c);
            }
        }
        Cow::Owned(escaped)
    }
}

/// 终端输出队列
pub struct Display {
    queue: OutputQueue,
    sanitizer: Box<dyn Sanitize>,
}

impl Default for Display {
    fn default() -> Self {
        Self::new(Box::new(EscapeControls))
    }
}

impl Display {
    pub fn new(sanitizer: Box<dyn Sanitize>) -> Self {
        Self {
            queue: OutputQueue::new(),
            sanitizer,
        }
    }

    pub fn push(&mut self, render: Render) {
        let bytes = match render {
            Render::Trusted(text) => text.into_bytes(),
            Render::Untrusted(text) => self.sanitizer.sanitize(&text).into_owned().into_bytes(),
        };
        if !bytes.is_empty() {
            self.queue.push_bytes(bytes);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn drain<W: Write>(&mut self, out: &mut W) -> io::Result<DrainStatus> {
        self.queue.drain(out)
    }

    /// 退出时丢弃未输出的文本
    pub fn discard(&mut self) -> usize {
        self.queue.discard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_controls() {
        let clean = EscapeControls.sanitize("héllo wörld");
        assert!(matches!(clean, Cow::Borrowed(_)));

        let dirty = EscapeControls.sanitize("evil\x1b[2Jtext\x07");
        assert_eq!(dirty, "evil\\u{1b}[2Jtext\\u{7}");
    }

    #[test]
    fn test_only_untrusted_is_sanitized() {
        let mut display = Display::default();
        display.push(Render::trusted("\x07bell\n"));
        display.push(Render::untrusted("\x1b"));
        display.push(Render::trusted(""));

        let mut out = Vec::new();
        assert_eq!(display.drain(&mut out).unwrap(), DrainStatus::Drained);
        assert_eq!(out, b"\x07bell\n\\u{1b}");
        assert!(!display.has_pending());
    }
}
