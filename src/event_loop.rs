//! 事件循环 - 单线程就绪驱动，每轮一次 mio 等待
//!
//! 每轮顺序：推进日志计数、发送网络队列、保活检查、更新监视集合、等待、
//! 检查错误、完成连接、处理一行输入、处理网络消息、输出终端、写聊天记录。
//! 所有描述符都是非阻塞的，WouldBlock 留到下一轮。

use crate::config::Config;
use crate::display::{Display, Render};
use crate::fd::{FdReader, FdWriter, NonBlockingGuard};
use crate::framing::{Encoding, FramingError, PacketEncoder, PacketReader};
use crate::history::HistorySink;
use crate::input::StdinLines;
use crate::keepalive::Keepalive;
use crate::message::{IcbMessage, MessageKind};
use crate::queue::{OutboundTask, OutputQueue};
use crate::session::{Effect, ExitReason, FeatureSet, Identity, ProtocolError, Session, SessionState};
use crate::watch::WatchSet;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::cell::Cell;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub const NET: Token = Token(0);
pub const STDOUT: Token = Token(1);
pub const STDIN: Token = Token(2);

/// 日志目标的令牌从这里开始编号
const LOG_BASE: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("分帧错误: {0}")]
    Framing(#[from] FramingError),

    #[error("协议错误: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    #[error("无法连接到 {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("{0} 上发生错误")]
    Stream(&'static str),
}

/// 运行统计
#[derive(Debug, Default, Clone)]
pub struct ClientStats {
    /// 已完整写出的数据包数
    pub packets_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub lines_submitted: u64,
}

/// 本轮就绪情况
#[derive(Debug, Default)]
struct Readiness {
    net_readable: bool,
    net_writable: bool,
    stdin: bool,
    logs: HashSet<usize>,
}

pub struct Client {
    session: Session,
    encoder: PacketEncoder,
    port: u16,
    socket: TcpStream,
    reader: PacketReader,
    net_queue: OutputQueue,
    display: Display,
    stdout: FdWriter,
    stdin: FdReader,
    input: StdinLines,
    history: Option<HistorySink>,
    poll: Poll,
    events: Events,
    watches: WatchSet,
    keepalive: Keepalive,
    exit_flag: Arc<AtomicBool>,
    info_flag: Option<Arc<AtomicBool>>,
    outcome: Option<ExitReason>,
    packets_sent: Rc<Cell<u64>>,
    stats: ClientStats,
    _nonblocking: Vec<NonBlockingGuard>,
}

impl Client {
    /// 使用进程的标准输入输出连接服务器
    pub fn connect(config: &Config, exit_flag: Arc<AtomicBool>) -> Result<Self, ClientError> {
        Self::with_terminal(config, exit_flag, libc::STDIN_FILENO, libc::STDOUT_FILENO)
    }

    /// 指定输入输出描述符连接服务器
    pub fn with_terminal(
        config: &Config,
        exit_flag: Arc<AtomicBool>,
        input_fd: RawFd,
        output_fd: RawFd,
    ) -> Result<Self, ClientError> {
        let mut display = Display::default();
        display.push(Render::Trusted(format!("Connecting to {} ... ", config.host)));

        let socket = start_connect(&config.host, config.port)?;

        let mut features = FeatureSet::default();
        if config.encoding == Encoding::Extended {
            warn!("已开启未经验证的扩展多包编码");
            features.insert(FeatureSet::EXT_PKT);
        }
        let session = Session::new(
            Identity {
                nick: config.nick.clone(),
                room: config.room.clone(),
                host: config.host.clone(),
            },
            features,
        );

        let history = config.history_dir.as_ref().and_then(|dir| match fs::create_dir_all(dir) {
            Ok(()) => {
                debug!("聊天记录目录 {}", dir.display());
                Some(HistorySink::new(dir, &config.room))
            }
            Err(e) => {
                warn!("无法创建聊天记录目录 {}: {}，不保存聊天记录", dir.display(), e);
                None
            }
        });

        let nonblocking = vec![NonBlockingGuard::new(input_fd)?, NonBlockingGuard::new(output_fd)?];

        let poll = Poll::new()?;
        let mut watches = WatchSet::new();
        watches.watch(poll.registry(), NET, socket.as_raw_fd());
        watches.watch(poll.registry(), STDIN, input_fd);
        watches.watch(poll.registry(), STDOUT, output_fd);

        Ok(Self {
            session,
            encoder: PacketEncoder::new(config.nick.len()),
            port: config.port,
            socket,
            reader: PacketReader::new(),
            net_queue: OutputQueue::new(),
            display,
            stdout: FdWriter(output_fd),
            stdin: FdReader(input_fd),
            input: StdinLines::new(),
            history,
            poll,
            events: Events::with_capacity(64),
            watches,
            keepalive: Keepalive::new(config.idle_interval, Instant::now()),
            exit_flag,
            info_flag: None,
            outcome: None,
            packets_sent: Rc::new(Cell::new(0)),
            stats: ClientStats::default(),
            _nonblocking: nonblocking,
        })
    }

    /// 置位时在终端显示一行会话信息
    pub fn with_info_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.info_flag = Some(flag);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            packets_sent: self.packets_sent.get(),
            ..self.stats.clone()
        }
    }

    /// 运行到会话结束，未送出的数据全部丢弃
    pub fn run(&mut self) -> Result<ExitReason, ClientError> {
        let result = self.run_loop();
        self.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<ExitReason, ClientError> {
        loop {
            if self.outcome.is_none() && self.exit_flag.load(Ordering::Relaxed) {
                info!("收到退出信号");
                self.outcome = Some(ExitReason::Interrupted);
            }
            if let Some(reason) = self.outcome {
                return Ok(reason);
            }
            self.iterate()?;
        }
    }

    fn iterate(&mut self) -> Result<(), ClientError> {
        if let Some(history) = self.history.as_mut() {
            history.begin_tick();
        }
        self.show_info_if_requested();

        let connecting = self.session.state() == SessionState::Connecting;
        if !connecting {
            self.net_queue.drain(&mut self.socket)?;
            self.check_keepalive(Instant::now());
        }

        self.update_watches()?;

        let timeout = if self.watches.has_ready_without_poll() || self.input.has_pending_line() {
            Some(Duration::ZERO)
        } else {
            self.keepalive.poll_timeout()
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let ready = self.collect_readiness(connecting)?;

        if connecting {
            if ready.net_writable {
                self.finish_connect()?;
            }
            return Ok(());
        }

        if ready.stdin || self.watches.ready_without_poll(STDIN) {
            self.input.fill_from(&mut self.stdin)?;
        }
        if let Some(line) = self.input.next_line() {
            self.stats.lines_submitted += 1;
            let effects = self.session.submit_line(&line);
            self.apply(effects);
        } else if self.input.is_closed() && self.outcome.is_none() {
            info!("标准输入已关闭");
            self.outcome = Some(ExitReason::InputClosed);
        }

        let now = Instant::now();
        if ready.net_readable {
            self.keepalive.on_input(now);
            self.receive()?;
        } else if self.keepalive.timed_out(now) && self.outcome.is_none() {
            error!("服务器长时间没有响应，超时退出");
            self.display.push(Render::trusted("Server timed out, exiting\n"));
            self.outcome = Some(ExitReason::Timeout);
        }

        self.display.drain(&mut self.stdout)?;

        let watches = &self.watches;
        let ready_logs = &ready.logs;
        if let Some(history) = self.history.as_mut() {
            history.flush(|id| ready_logs.contains(&id) || watches.ready_without_poll(log_token(id)));
        }
        Ok(())
    }

    fn update_watches(&mut self) -> Result<(), ClientError> {
        let registry = self.poll.registry();
        let connecting = self.session.state() == SessionState::Connecting;

        let net = if connecting || !self.net_queue.is_empty() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.watches.set_interest(registry, NET, Some(net))?;

        let stdin = (!connecting && !self.input.is_closed()).then_some(Interest::READABLE);
        self.watches.set_interest(registry, STDIN, stdin)?;

        let stdout = self.display.has_pending().then_some(Interest::WRITABLE);
        self.watches.set_interest(registry, STDOUT, stdout)?;

        let descriptors = self.history.as_ref().map(HistorySink::descriptors).unwrap_or_default();
        self.watches.retain(registry, |token| {
            token.0 < LOG_BASE || descriptors.iter().any(|(id, ..)| log_token(*id) == token)
        });
        for (id, fd, pending) in descriptors {
            let token = log_token(id);
            self.watches.watch(registry, token, fd);
            self.watches.set_interest(registry, token, pending.then_some(Interest::WRITABLE))?;
        }
        Ok(())
    }

    fn collect_readiness(&self, connecting: bool) -> Result<Readiness, ClientError> {
        let mut ready = Readiness::default();
        for event in self.events.iter() {
            trace!("就绪事件 {:?}", event);
            match event.token() {
                NET => {
                    // 连接阶段的错误由 finish_connect 取出具体原因
                    if event.is_error() && !connecting {
                        return Err(ClientError::Stream("network"));
                    }
                    ready.net_readable |= event.is_readable() || event.is_read_closed();
                    ready.net_writable |= event.is_writable() || event.is_error();
                }
                STDIN => {
                    if event.is_error() {
                        return Err(ClientError::Stream("stdin"));
                    }
                    ready.stdin = true;
                }
                STDOUT => {
                    if event.is_error() || event.is_write_closed() {
                        return Err(ClientError::Stream("stdout"));
                    }
                }
                Token(n) if n >= LOG_BASE => {
                    ready.logs.insert(n - LOG_BASE);
                }
                token => trace!("忽略未知令牌 {:?}", token),
            }
        }
        Ok(ready)
    }

    fn finish_connect(&mut self) -> Result<(), ClientError> {
        let host = &self.session.identity().host;
        if let Some(source) = self.socket.take_error()? {
            return Err(ClientError::Connect {
                host: host.clone(),
                port: self.port,
                source,
            });
        }
        match self.socket.peer_addr() {
            Ok(addr) => debug!("TCP 连接已建立: {}", addr),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                trace!("连接尚未完成");
                return Ok(());
            }
            Err(source) => {
                return Err(ClientError::Connect {
                    host: host.clone(),
                    port: self.port,
                    source,
                });
            }
        }

        self.keepalive.on_input(Instant::now());
        let effects = self.session.on_connected();
        self.apply(effects);
        Ok(())
    }

    /// 读入所有可读数据并逐个处理完整消息
    fn receive(&mut self) -> Result<(), ClientError> {
        let status = self.reader.fill_from(&mut self.socket)?;
        self.stats.bytes_received += status.bytes_read as u64;

        while self.outcome.is_none() {
            let Some(msg) = self.reader.try_parse_next()? else {
                break;
            };
            self.stats.messages_received += 1;
            let effects = self.session.handle_message(&msg)?;
            self.apply(effects);
        }

        if status.closed && self.outcome.is_none() {
            info!("服务器关闭了连接");
            self.display.push(Render::Trusted(format!(
                "Server {} closed connection, exiting...\n",
                self.session.identity().host
            )));
            self.outcome = Some(ExitReason::ConnectionClosed);
        }
        Ok(())
    }

    fn check_keepalive(&mut self, now: Instant) {
        if !self.keepalive.due(now) {
            return;
        }
        let probe = self.session.keepalive_message();
        if probe.kind() == MessageKind::Ping {
            self.keepalive.on_probe_sent();
            debug!("发送第 {} 个保活 ping", self.keepalive.probes_sent());
        } else {
            self.keepalive.on_noop_sent(now);
            debug!("发送保活 no-op");
        }
        self.transmit(&probe);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Transmit(msg) => self.transmit(&msg),
                Effect::Render(render) => self.display.push(render),
                Effect::Log(entry) => {
                    if let Some(history) = self.history.as_mut() {
                        history.record(&entry);
                    }
                }
                Effect::Exit(reason) => {
                    debug!("会话结束: {:?}", reason);
                    self.outcome.get_or_insert(reason);
                    self.exit_flag.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// 编码并排入网络队列，写完一个数据包计数一次
    fn transmit(&mut self, msg: &IcbMessage) {
        let packets = self.encoder.encode(self.session.encoding(), msg.kind, &msg.data);
        trace!("发送 '{}' 类型消息，{} 段", msg.kind(), packets.len());
        for packet in packets {
            let counter = Rc::clone(&self.packets_sent);
            self.net_queue.enqueue(OutboundTask::with_callback(packet, move |_| {
                counter.set(counter.get() + 1);
            }));
        }
    }

    fn show_info_if_requested(&mut self) {
        let Some(flag) = &self.info_flag else {
            return;
        };
        if flag.swap(false, Ordering::Relaxed) {
            let identity = self.session.identity();
            self.display.push(Render::Trusted(format!(
                "icb: sitting in room {} at {}:{} as {} ({})\n",
                identity.room,
                identity.host,
                self.port,
                identity.nick,
                self.session.state()
            )));
        }
    }

    fn shutdown(&mut self) {
        let net = self.net_queue.discard();
        let dropped_output = self.display.discard();
        if let Some(history) = self.history.as_mut() {
            history.discard();
        }
        if net + dropped_output > 0 {
            debug!("退出时丢弃 {} 个网络任务和 {} 段终端输出", net, dropped_output);
        }
        let stats = self.stats();
        info!(
            "会话统计: 发送 {} 个数据包，收到 {} 条消息 ({} 字节)，输入 {} 行",
            stats.packets_sent, stats.messages_received, stats.bytes_received, stats.lines_submitted
        );
    }
}

fn log_token(id: usize) -> Token {
    Token(LOG_BASE + id)
}

/// 解析地址并发起非阻塞连接，使用第一个能发起连接的地址
fn start_connect(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let connect_error = |source: io::Error| ClientError::Connect {
        host: host.to_string(),
        port,
        source,
    };

    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "没有可用的地址");
    for addr in (host, port).to_socket_addrs().map_err(connect_error)? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                debug!("正在连接 {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("连接 {} 失败: {}", addr, e);
                last_error = e;
            }
        }
    }
    Err(connect_error(last_error))
}
