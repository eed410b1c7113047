//! 输出队列 - 每个目标一个按序发送的非阻塞写队列
//!
//! 网络连接、终端、每个聊天记录文件各有一个队列，由事件循环在可写时调用
//! [`OutputQueue::drain`]。同一队列内严格按入队顺序交付，不同队列之间没有顺序保证。

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use tracing::trace;

/// 任务完成回调
pub type Completion = Box<dyn FnOnce(&OutboundTask)>;

/// 待写出的一段数据
pub struct OutboundTask {
    data: Box<[u8]>,
    written: usize,
    on_complete: Option<Completion>,
}

impl OutboundTask {
    pub fn new(data: impl Into<Box<[u8]>>) -> Self {
        Self {
            data: data.into(),
            written: 0,
            on_complete: None,
        }
    }

    /// 创建带完成回调的任务，回调在最后一个字节写出后调用一次
    pub fn with_callback(data: impl Into<Box<[u8]>>, callback: impl FnOnce(&OutboundTask) + 'static) -> Self {
        Self {
            data: data.into(),
            written: 0,
            on_complete: Some(Box::new(callback)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    fn is_complete(&self) -> bool {
        self.written >= self.data.len()
    }
}

impl fmt::Debug for OutboundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundTask")
            .field("len", &self.data.len())
            .field("written", &self.written)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// 一次 drain 调用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// 队列已清空
    Drained,
    /// 发生部分写入，目标暂时写不下更多
    Partial,
    /// 目标返回 WouldBlock
    Blocked,
}

/// 单个目标的 FIFO 写队列
#[derive(Debug, Default)]
pub struct OutputQueue {
    tasks: VecDeque<OutboundTask>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加到队尾
    pub fn enqueue(&mut self, task: OutboundTask) {
        self.tasks.push_back(task);
    }

    pub fn push_bytes(&mut self, data: impl Into<Box<[u8]>>) {
        self.enqueue(OutboundTask::new(data));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 尚未写出的总字节数
    pub fn pending_bytes(&self) -> usize {
        self.tasks.iter().map(|t| t.len() - t.written).sum()
    }

    /// 丢弃所有未写出的任务（不触发回调），返回丢弃的任务数
    pub fn discard(&mut self) -> usize {
        let count = self.tasks.len();
        self.tasks.clear();
        count
    }

    /// 把队首任务尽量写入 `out`
    ///
    /// 部分写入时记录进度并停止；任务写完则出队、调用回调并继续下一个；
    /// WouldBlock 停止但不算错误；其他错误原样返回给调用方。
    pub fn drain<W: Write>(&mut self, out: &mut W) -> io::Result<DrainStatus> {
        loop {
            let Some(task) = self.tasks.front_mut() else {
                return Ok(DrainStatus::Drained);
            };

            if !task.is_complete() {
                match out.write(task.remaining()) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "目标不再接受数据"));
                    }
                    Ok(n) => {
                        task.written += n;
                        trace!("已写出 {}/{} 字节", task.written, task.len());
                        if !task.is_complete() {
                            return Ok(DrainStatus::Partial);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(DrainStatus::Blocked);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            if let Some(mut done) = self.tasks.pop_front() {
                if let Some(callback) = done.on_complete.take() {
                    callback(&done);
                }
            }
        }
    }
}
