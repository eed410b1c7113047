//! 聊天记录 - 每个房间/私聊对象一个只追加的日志文件
//!
//! 每个日志目标有自己的输出队列，文件在第一次写出时才打开。
//! 打开失败的目标永久停用，之后写给它的记录全部丢弃。
//! 空闲（队列为空且本轮未写入）的目标会被回收并关闭文件。

use crate::queue::OutputQueue;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// 服务器对不存在用户的错误前缀，这类错误记到私聊日志里
const NO_SUCH_USER: &str = "No such user ";

/// 一条待记录的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: u8,
    /// 对方昵称（收到的消息）或私聊对象（发出的消息）
    pub peer: String,
    pub text: String,
    pub incoming: bool,
}

impl LogEntry {
    pub fn incoming(kind: u8, peer: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            peer: peer.into(),
            text: text.into(),
            incoming: true,
        }
    }

    pub fn outgoing(kind: u8, peer: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            peer: peer.into(),
            text: text.into(),
            incoming: false,
        }
    }

    fn origin(&self) -> &str {
        if self.incoming { &self.peer } else { "me" }
    }
}

/// 单个日志文件
#[derive(Debug)]
struct LogTarget {
    id: usize,
    path: PathBuf,
    file: Option<File>,
    queue: OutputQueue,
    last_touched: u64,
    failed: bool,
}

impl LogTarget {
    fn create(id: usize, path: PathBuf, tick: u64) -> Self {
        let failed = match path.parent() {
            Some(dir) => match fs::create_dir_all(dir) {
                Ok(()) => false,
                Err(e) => {
                    warn!("无法创建日志目录 {}: {}", dir.display(), e);
                    true
                }
            },
            None => false,
        };

        Self {
            id,
            path,
            file: None,
            queue: OutputQueue::new(),
            last_touched: tick,
            failed,
        }
    }

    fn open(&mut self) -> bool {
        let result = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o666)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path);

        match result {
            Ok(file) => {
                debug!("打开日志文件 {}", self.path.display());
                self.file = Some(file);
                true
            }
            Err(e) => {
                let dropped = self.queue.discard();
                warn!("无法打开日志文件 {}: {}，丢弃 {} 条记录", self.path.display(), e, dropped);
                self.failed = true;
                false
            }
        }
    }

    fn flush(&mut self) {
        if self.failed || self.queue.is_empty() {
            return;
        }
        if self.file.is_none() && !self.open() {
            return;
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };

        if let Err(e) = self.queue.drain(file) {
            // 关闭文件，下一轮重新打开
            warn!("写入日志文件 {} 失败: {}", self.path.display(), e);
            self.file = None;
        }
    }
}

/// 所有日志目标的集合
#[derive(Debug)]
pub struct HistorySink {
    base_dir: PathBuf,
    room: String,
    targets: HashMap<PathBuf, LogTarget>,
    tick: u64,
    next_id: usize,
}

impl HistorySink {
    pub fn new(base_dir: impl Into<PathBuf>, room: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            room: room.into(),
            targets: HashMap::new(),
            tick: 0,
            next_id: 0,
        }
    }

    /// 消息对应的日志文件路径
    pub fn log_path_for(&self, kind: u8, peer: &str, text: &str) -> PathBuf {
        let name = if kind == b'e' && text.starts_with(NO_SUCH_USER) {
            format!("private-{}.log", file_component(&text[NO_SUCH_USER.len()..]))
        } else if kind != b'c' {
            format!("room-{}.log", file_component(&self.room))
        } else {
            format!("private-{}.log", file_component(peer))
        };
        self.base_dir.join(name)
    }

    pub fn record(&mut self, entry: &LogEntry) {
        self.record_at(entry, Local::now());
    }

    /// 以指定时间戳排队一条记录
    pub fn record_at(&mut self, entry: &LogEntry, when: DateTime<Local>) {
        let path = self.log_path_for(entry.kind, &entry.peer, &entry.text);
        let tick = self.tick;
        let next_id = &mut self.next_id;
        let target = self.targets.entry(path).or_insert_with_key(|path| {
            let id = *next_id;
            *next_id += 1;
            LogTarget::create(id, path.clone(), tick)
        });

        target.last_touched = tick;
        if target.failed {
            trace!("日志目标 {} 已停用，丢弃记录", target.path.display());
            return;
        }

        let line = format!(
            "{} {}: {}\n",
            when.format("%Y-%m-%d %H:%M:%S"),
            entry.origin(),
            entry.text
        );
        target.queue.push_bytes(line.into_bytes());
    }

    /// 新一轮开始：回收空闲目标并推进计数
    ///
    /// 比较的是上一轮的计数，所以在第 N 轮最后一次写入的目标要到第 N+2 轮
    /// 开始时才被回收，比"早于当前轮"的规则晚一轮。停用的目标不回收。
    pub fn begin_tick(&mut self) {
        let tick = self.tick;
        self.targets.retain(|path, target| {
            // 停用的目标保留，避免重新创建后再次尝试打开
            let keep = target.failed || !target.queue.is_empty() || target.last_touched >= tick;
            if !keep {
                trace!("回收空闲日志目标 {}", path.display());
            }
            keep
        });
        self.tick += 1;
    }

    /// 写出所有待写记录
    ///
    /// `ready` 判断已打开的目标本轮是否可写；尚未打开的目标总会尝试打开。
    pub fn flush(&mut self, ready: impl Fn(usize) -> bool) {
        for target in self.targets.values_mut() {
            if target.file.is_none() || ready(target.id) {
                target.flush();
            }
        }
    }

    /// 还有未写出的记录
    pub fn has_pending(&self) -> bool {
        self.targets.values().any(|t| !t.failed && !t.queue.is_empty())
    }

    /// 已打开的目标：(编号, 描述符, 是否有待写数据)
    pub fn descriptors(&self) -> Vec<(usize, RawFd, bool)> {
        self.targets
            .values()
            .filter_map(|t| t.file.as_ref().map(|f| (t.id, f.as_raw_fd(), !t.queue.is_empty())))
            .collect()
    }

    pub fn is_failed(&self, path: &Path) -> bool {
        self.targets.get(path).is_some_and(|t| t.failed)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// 退出时丢弃未写出的记录
    pub fn discard(&mut self) {
        for target in self.targets.values_mut() {
            target.queue.discard();
        }
    }
}

/// 昵称或房间名作为文件名时替换路径分隔符和 NUL
fn file_component(name: &str) -> String {
    name.replace(['/', '\0'], "_")
}
