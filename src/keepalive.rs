//! 空闲保活与超时判断

use std::time::{Duration, Instant};

/// 超时倍数：超过这么多个间隔没有收到任何数据视为服务器失联
const TIMEOUT_FACTOR: u32 = 3;

#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Option<Duration>,
    last_input: Instant,
    probes_sent: u32,
}

impl Keepalive {
    /// 间隔为 0 表示关闭保活
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval: (!interval.is_zero()).then_some(interval),
            last_input: now,
            probes_sent: 0,
        }
    }

    /// 是否该发送下一个探测
    pub fn due(&self, now: Instant) -> bool {
        match self.interval {
            Some(interval) => now > self.last_input + interval * (self.probes_sent + 1),
            None => false,
        }
    }

    /// 已发送 ping
    pub fn on_probe_sent(&mut self) {
        self.probes_sent += 1;
    }

    /// 服务器不支持 ping 时改发 no-op，并重新计时
    pub fn on_noop_sent(&mut self, now: Instant) {
        self.last_input = now;
    }

    /// 收到任何网络数据
    pub fn on_input(&mut self, now: Instant) {
        self.last_input = now;
        self.probes_sent = 0;
    }

    pub fn probes_sent(&self) -> u32 {
        self.probes_sent
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        match self.interval {
            Some(interval) => now > self.last_input + interval * TIMEOUT_FACTOR,
            None => false,
        }
    }

    /// 事件等待超时：间隔的十分之一，关闭保活时无限等待
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.interval.map(|interval| interval / 10)
    }
}
