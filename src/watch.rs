//! 动态监视集合 - 每轮根据待处理工作更新各描述符的关注事件
//!
//! mio 在 Linux 上是边沿触发，所以有兴趣的描述符每轮都重新注册一次，
//! 让已经就绪的状态再次上报。epoll 拒绝普通文件 (EPERM)，这类描述符
//! 记为“总是就绪”，有待写数据时调用方不应阻塞等待。

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// 由 mio 等待
    Polled,
    /// 无法等待，视为随时可读写
    AlwaysReady,
}

#[derive(Debug)]
struct WatchEntry {
    fd: RawFd,
    mode: WatchMode,
    registered: bool,
    wanted: Option<Interest>,
}

#[derive(Debug, Default)]
pub struct WatchSet {
    entries: HashMap<Token, WatchEntry>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入监视；同一令牌换了描述符时视为新条目
    pub fn watch(&mut self, registry: &Registry, token: Token, fd: RawFd) {
        if let Some(entry) = self.entries.get(&token) {
            if entry.fd == fd {
                return;
            }
            self.unwatch(registry, token);
        }
        self.entries.insert(
            token,
            WatchEntry {
                fd,
                mode: WatchMode::Polled,
                registered: false,
                wanted: None,
            },
        );
    }

    pub fn unwatch(&mut self, registry: &Registry, token: Token) {
        if let Some(entry) = self.entries.remove(&token) {
            if entry.registered {
                // 描述符可能已经关闭，注销失败无所谓
                let _ = registry.deregister(&mut SourceFd(&entry.fd));
            }
        }
    }

    /// 只保留 `keep` 返回 true 的条目
    pub fn retain(&mut self, registry: &Registry, keep: impl Fn(Token) -> bool) {
        let stale: Vec<Token> = self.entries.keys().copied().filter(|t| !keep(*t)).collect();
        for token in stale {
            trace!("移除监视 {:?}", token);
            self.unwatch(registry, token);
        }
    }

    /// 设置本轮关注的事件，`None` 表示本轮不关心
    pub fn set_interest(&mut self, registry: &Registry, token: Token, interest: Option<Interest>) -> io::Result<()> {
        let Some(entry) = self.entries.get_mut(&token) else {
            return Ok(());
        };
        entry.wanted = interest;
        if entry.mode == WatchMode::AlwaysReady {
            return Ok(());
        }

        match interest {
            Some(interest) => {
                let result = if entry.registered {
                    registry.reregister(&mut SourceFd(&entry.fd), token, interest)
                } else {
                    registry.register(&mut SourceFd(&entry.fd), token, interest)
                };
                match result {
                    Ok(()) => entry.registered = true,
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        debug!("描述符 {} 不支持事件等待，视为总是就绪", entry.fd);
                        entry.mode = WatchMode::AlwaysReady;
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                if entry.registered {
                    registry.deregister(&mut SourceFd(&entry.fd))?;
                    entry.registered = false;
                }
            }
        }
        Ok(())
    }

    pub fn mode(&self, token: Token) -> Option<WatchMode> {
        self.entries.get(&token).map(|e| e.mode)
    }

    /// 是否有不经等待就能处理的工作
    pub fn has_ready_without_poll(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.mode == WatchMode::AlwaysReady && e.wanted.is_some())
    }

    pub fn ready_without_poll(&self, token: Token) -> bool {
        self.entries
            .get(&token)
            .is_some_and(|e| e.mode == WatchMode::AlwaysReady && e.wanted.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
