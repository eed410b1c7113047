//! ICB分帧模块 - 固定步长数据包的编码与重组
//!
//! 线路格式: [长度字节N][类型字节][N-1字节数据]
//! 长度字节 N 计入类型字节和数据，所以单个数据包最多携带 253 字节数据。
//!
//! 接收方向按 256 字节步长扫描：
//! - 长度字节为 0 的块是续包，携带 254 字节数据，消息在下一个块继续
//! - 长度字节非 0 的块是消息的最后一个数据包
//!
//! 发送方向提供两种编码：
//! - 标准模式：拆分成互相独立、各自完整的数据包（兼容不会重组的实现）
//! - 扩展模式：256 字节续包串联，尚未在真实服务器上验证，只能显式开启

use crate::message::{IcbMessage, MessageKind};
use std::io::{self, Read};
use tracing::{debug, trace};

/// 接收方向的块步长
pub const PACKET_STRIDE: usize = 256;

/// 续包中的数据字节数
pub const CONTINUATION_PAYLOAD: usize = 254;

/// 单个数据包的数据上限（长度字节只有一个字节）
pub const MAX_PACKET_DATA: usize = 253;

/// 昵称长度上限（不含）
pub const NICKNAME_MAX: usize = 64;

/// 接收缓冲区上限
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// 分帧错误类型
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("同一消息内的数据包类型不一致: 期望 '{expected}'，实际 '{found}'")]
    MixedTypes { expected: char, found: char },

    #[error("消息长度超出限制: {length}字节 (最大{max}字节)")]
    MessageTooLarge { length: usize, max: usize },

    #[error("IO错误: {0}")]
    IoError(#[from] io::Error),
}

/// 发送编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Standard,
    /// 未经验证的多包编码
    Extended,
}

/// 标准模式编码器
///
/// 每个分片的数据预算为 `ceiling - (昵称长度 + 1) - 公共前缀长度`，
/// 给服务器转发时在前面插入发送者昵称留出空间。
#[derive(Debug, Clone, Copy)]
pub struct PacketEncoder {
    ceiling: usize,
    nick_len: usize,
}

impl PacketEncoder {
    pub fn new(nick_len: usize) -> Self {
        Self::with_ceiling(nick_len, MAX_PACKET_DATA)
    }

    /// 指定数据上限（不会超过 253）
    pub fn with_ceiling(nick_len: usize, ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.min(MAX_PACKET_DATA),
            nick_len,
        }
    }

    /// 按给定编码方式把一个逻辑消息编码成若干段线路数据
    pub fn encode(&self, encoding: Encoding, kind: u8, payload: &[u8]) -> Vec<Vec<u8>> {
        match encoding {
            Encoding::Standard => self.encode_standard(kind, payload),
            Encoding::Extended => vec![encode_extended(kind, payload)],
        }
    }

    /// 分片预算
    pub fn budget(&self, common_len: usize) -> usize {
        self.ceiling
            .saturating_sub(self.nick_len + 1)
            .saturating_sub(common_len)
            .max(1)
    }

    /// 标准模式：拆成互相独立的数据包
    ///
    /// 公开消息和私聊命令尽量在空白或标点之后断开；私聊命令的
    /// `m\x01昵称 ` 前缀会复制到每一个分片里，保证对方收到的每一片都能投递。
    pub fn encode_standard(&self, kind: u8, payload: &[u8]) -> Vec<Vec<u8>> {
        let private = is_private_command(kind, payload);
        let common_len = if private { common_prefix_len(payload) } else { 0 };
        let (common, mut rest) = payload.split_at(common_len);
        let budget = self.budget(common_len);
        let word_split = kind == MessageKind::Open.code() || private;

        let mut packets = Vec::new();
        loop {
            let take = if rest.len() > budget {
                if word_split {
                    split_point(rest, budget)
                } else {
                    budget
                }
            } else {
                rest.len()
            };
            let (chunk, tail) = rest.split_at(take);

            // 长度字节 = 类型 + 公共前缀 + 分片 + 结尾 NUL
            let mut packet = Vec::with_capacity(common_len + take + 3);
            packet.push((common_len + take + 2) as u8);
            packet.push(kind);
            packet.extend_from_slice(common);
            packet.extend_from_slice(chunk);
            packet.push(0);
            packets.push(packet);

            rest = tail;
            if rest.is_empty() {
                break;
            }
        }

        trace!(
            "类型 '{}' 的消息 ({} 字节) 编码为 {} 个标准数据包，预算 {} 字节",
            kind as char,
            payload.len(),
            packets.len(),
            budget
        );
        packets
    }
}

/// 扩展模式：256 字节续包串联
///
/// 数据末尾隐含一个 NUL。除最后一块外都是 `[0][类型][254字节]`，
/// 最后一块是 `[r+1][类型][r字节]`，r 在 1..=254 之间，
/// 因此长度恰好是 254 倍数的消息也会得到非零长度字节的结尾块。
/// 最后一块只发送有效的 r+2 字节，后续消息的步长才能对齐。
pub fn encode_extended(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 1);
    body.extend_from_slice(payload);
    body.push(0);

    let blocks = body.len().div_ceil(CONTINUATION_PAYLOAD);
    let mut wire = Vec::with_capacity(blocks * PACKET_STRIDE);
    for (index, chunk) in body.chunks(CONTINUATION_PAYLOAD).enumerate() {
        if index + 1 < blocks {
            wire.push(0);
        } else {
            wire.push((chunk.len() + 1) as u8);
        }
        wire.push(kind);
        wire.extend_from_slice(chunk);
    }

    debug!(
        "类型 '{}' 的消息 ({} 字节) 编码为 {} 个扩展块",
        kind as char,
        payload.len(),
        blocks
    );
    wire
}

/// 是否为私聊命令 (`m\x01...` 或 `msg\x01...`)
pub fn is_private_command(kind: u8, payload: &[u8]) -> bool {
    kind == MessageKind::Command.code()
        && (payload.starts_with(b"m\x01") || payload.starts_with(b"msg\x01"))
}

/// 私聊命令的公共前缀长度：到第一个空格为止（含空格）
fn common_prefix_len(payload: &[u8]) -> usize {
    match payload.iter().position(|&b| b == b' ') {
        Some(pos) if pos < NICKNAME_MAX + 3 => pos + 1,
        _ => 0,
    }
}

/// 在预算内寻找断点
///
/// 从 `budget-1` 向前扫描到下标 1，第一个空白或标点之后断开
/// （分隔符留在前一片末尾）；找不到则在预算处硬切。
pub fn split_point(chunk: &[u8], budget: usize) -> usize {
    let limit = budget.min(chunk.len());
    (1..limit)
        .rev()
        .find(|&i| is_break_byte(chunk[i]))
        .map(|i| i + 1)
        .unwrap_or(limit)
}

fn is_break_byte(b: u8) -> bool {
    b == b' ' || b == b'\t' || b.is_ascii_punctuation()
}

/// 读取结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FillStatus {
    pub bytes_read: usize,
    /// 对端关闭了连接
    pub closed: bool,
}

/// 接收缓冲区与消息重组器
pub struct PacketReader {
    buffer: Vec<u8>,
    max_buffer_size: usize,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketReader {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            max_buffer_size: MAX_BUFFER_SIZE,
        }
    }

    /// 添加接收到的数据
    pub fn append_data(&mut self, data: &[u8]) -> Result<(), FramingError> {
        let length = self.buffer.len() + data.len();
        if length > self.max_buffer_size {
            // 缓冲区过大，清空并返回错误
            self.buffer.clear();
            return Err(FramingError::MessageTooLarge {
                length,
                max: self.max_buffer_size,
            });
        }

        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// 读取当前所有可读数据（非阻塞）
    ///
    /// WouldBlock 结束本轮读取但不算错误；读到 0 字节表示对端关闭。
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> Result<FillStatus, FramingError> {
        let mut chunk = [0u8; 4096];
        let mut status = FillStatus::default();

        loop {
            match source.read(&mut chunk) {
                Ok(0) => {
                    status.closed = true;
                    break;
                }
                Ok(n) => {
                    self.append_data(&chunk[..n])?;
                    status.bytes_read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        trace!("本轮读取 {} 字节，缓冲区 {} 字节", status.bytes_read, self.buffer.len());
        Ok(status)
    }

    /// 尝试解析下一个完整消息
    ///
    /// # 返回
    /// * `Ok(Some(IcbMessage))` - 解析出一个消息，已从缓冲区移除该消息数据
    /// * `Ok(None)` - 数据不完整，需要更多数据
    /// * `Err(FramingError)` - 同一消息的数据包类型不一致
    pub fn try_parse_next(&mut self) -> Result<Option<IcbMessage>, FramingError> {
        // 找到结尾数据包
        let mut last = 0;
        loop {
            if last >= self.buffer.len() {
                return Ok(None);
            }
            if self.buffer[last] != 0 {
                break;
            }
            if last + PACKET_STRIDE > self.buffer.len() {
                return Ok(None);
            }
            last += PACKET_STRIDE;
        }

        let end = last + 1 + self.buffer[last] as usize;
        if end > self.buffer.len() {
            return Ok(None);
        }

        let kind = self.buffer[last + 1];
        let mut data = Vec::with_capacity(end);
        for start in (0..=last).step_by(PACKET_STRIDE) {
            let found = self.buffer[start + 1];
            if found != kind {
                self.buffer.clear();
                return Err(FramingError::MixedTypes {
                    expected: kind as char,
                    found: found as char,
                });
            }

            // 前一块末尾的 NUL 是填充字节
            if start != 0 && data.last() == Some(&0) {
                data.pop();
            }

            let stop = if start == last { end } else { start + PACKET_STRIDE };
            data.extend_from_slice(&self.buffer[start + 2..stop]);
        }

        if data.last() == Some(&0) {
            data.pop();
        }

        trace!(
            "解析出消息: 头部 {} 块数 {} 数据 {} 字节",
            hex::encode(&self.buffer[last..last + 2]),
            last / PACKET_STRIDE + 1,
            data.len()
        );
        self.buffer.drain(..end);

        Ok(Some(IcbMessage { kind, data }))
    }

    /// 获取缓冲区当前大小
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn sample_text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    fn decode_all(wire: &[u8]) -> Vec<IcbMessage> {
        let mut reader = PacketReader::new();
        reader.append_data(wire).unwrap();
        let mut messages = Vec::new();
        while let Some(msg) = reader.try_parse_next().unwrap() {
            messages.push(msg);
        }
        assert_eq!(reader.buffer_size(), 0);
        messages
    }

    /// 每次读一段，读完返回 WouldBlock
    struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_standard_roundtrip() {
        let encoder = PacketEncoder::new("alice".len());
        for len in [0, 1, 252, 253, 254, 1000, 100_000] {
            let original = sample_text(len);
            let packets = encoder.encode_standard(b'b', &original);

            let mut wire = Vec::new();
            for packet in &packets {
                let n = packet[0] as usize;
                assert_eq!(packet.len(), n + 1);
                assert!(n - 1 <= MAX_PACKET_DATA);
                assert_eq!(packet[1], b'b');
                wire.extend_from_slice(packet);
            }

            let messages = decode_all(&wire);
            assert_eq!(messages.len(), packets.len());
            let rebuilt: Vec<u8> = messages.iter().flat_map(|m| m.data.clone()).collect();
            assert_eq!(rebuilt, original, "长度 {len} 往返失败");
        }
    }

    #[test]
    fn test_extended_roundtrip() {
        for len in [0, 1, 252, 253, 254, 508, 1000, 100_000] {
            let original = sample_text(len);
            let wire = encode_extended(b'b', &original);
            let messages = decode_all(&wire);
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].kind, b'b');
            assert_eq!(messages[0].data, original, "长度 {len} 往返失败");
        }
    }

    #[test]
    fn test_extended_exact_multiple_final_block() {
        // 253 + NUL 正好填满一块
        let wire = encode_extended(b'b', &sample_text(253));
        assert_eq!(wire.len(), 256);
        assert_eq!(wire[0], 255);

        // 254 字节数据：一块续包 + 只含 NUL 的结尾块
        let wire = encode_extended(b'b', &sample_text(254));
        assert_eq!(wire.len(), 256 + 3);
        assert_eq!(wire[0], 0);
        assert_eq!(&wire[256..], &[2, b'b', 0]);
    }

    #[test]
    fn test_extended_messages_back_to_back() {
        let first = sample_text(700);
        let second = sample_text(10);
        let mut wire = encode_extended(b'b', &first);
        wire.extend(encode_extended(b'c', &second));

        let messages = decode_all(&wire);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data, first);
        assert_eq!(messages[1].kind, b'c');
        assert_eq!(messages[1].data, second);
    }

    #[test]
    fn test_prefix_needs_more_data() {
        let mut wire = encode_extended(b'b', &sample_text(1000));
        let extended_len = wire.len();
        wire.extend(PacketEncoder::new(5).encode_standard(b'b', b"tail").concat());

        for cut in 0..extended_len {
            let mut reader = PacketReader::new();
            reader.append_data(&wire[..cut]).unwrap();
            assert!(reader.try_parse_next().unwrap().is_none(), "截断 {cut} 字节应需要更多数据");
            assert_eq!(reader.buffer_size(), cut);
        }

        let mut reader = PacketReader::new();
        reader.append_data(&wire[..wire.len() - 1]).unwrap();
        assert!(reader.try_parse_next().unwrap().is_some());
        assert!(reader.try_parse_next().unwrap().is_none());
    }

    #[test]
    fn test_mixed_types_is_fatal() {
        let mut wire = encode_extended(b'b', &sample_text(600));
        wire[PACKET_STRIDE + 1] = b'c';

        let mut reader = PacketReader::new();
        reader.append_data(&wire).unwrap();
        match reader.try_parse_next() {
            Err(FramingError::MixedTypes { expected, found }) => {
                assert_eq!(expected, 'b');
                assert_eq!(found, 'c');
            }
            other => panic!("应为类型不一致错误: {other:?}"),
        }
    }

    #[test]
    fn test_padding_nul_absorbed() {
        // 续包最后一个数据字节是 NUL 时视为填充
        let mut wire = vec![0, b'd'];
        wire.extend(std::iter::repeat_n(b'x', 253));
        wire.push(0);
        wire.extend([4, b'd', b'y', b'z', 0]);

        let messages = decode_all(&wire);
        assert_eq!(messages.len(), 1);
        let mut expected = vec![b'x'; 253];
        expected.extend(b"yz");
        assert_eq!(messages[0].data, expected);
    }

    #[test]
    fn test_missing_nul_tolerated() {
        let messages = decode_all(&[3, b'b', b'h', b'i']);
        assert_eq!(messages[0].data, b"hi");
    }

    #[test]
    fn test_split_point() {
        assert_eq!(split_point(b"hello there friend", 10), 6);
        assert_eq!(split_point(b"abcdefghijklmno", 10), 10);
        assert_eq!(split_point(b"abc,defghijkl", 10), 4);
        // 下标 0 的空白不算断点
        assert_eq!(split_point(b" abcdefghijk", 10), 10);
        // 预算边界上的空格本身可以作为断点
        assert_eq!(split_point(b"abcdefghi jkl", 10), 10);
    }

    #[test]
    fn test_pinned_split_scenario() {
        // 昵称 alice，上限 16：预算 16 - (5 + 1) = 10
        let encoder = PacketEncoder::with_ceiling("alice".len(), 16);
        assert_eq!(encoder.budget(0), 10);

        let packets = encoder.encode_standard(b'b', b"hello there friend");
        let fragments: Vec<&[u8]> = packets.iter().map(|p| &p[2..p.len() - 1]).collect();
        assert_eq!(fragments, vec![&b"hello "[..], &b"there "[..], &b"friend"[..]]);
        assert_eq!(packets[0], b"\x08bhello \x00".to_vec());
    }

    #[test]
    fn test_hard_cut_for_commands() {
        let encoder = PacketEncoder::with_ceiling(5, 16);
        let packets = encoder.encode_standard(b'h', b"topic a b c d e f");
        assert_eq!(&packets[0][2..12], b"topic a b ");
        assert_eq!(packets[0][0], 12);
    }

    #[test]
    fn test_private_prefix_repeated() {
        let encoder = PacketEncoder::new("alice".len());
        let mut payload = b"m\x01bob ".to_vec();
        payload.extend(std::iter::repeat_n(b'x', 300));

        let packets = encoder.encode_standard(b'h', &payload);
        assert_eq!(packets.len(), 2);
        // 253 - 6 - 6 = 241
        assert_eq!(packets[0].len(), 3 + 6 + 241);
        for packet in &packets {
            assert!(packet[2..].starts_with(b"m\x01bob "));
        }

        let messages = decode_all(&packets.concat());
        let body: usize = messages.iter().map(|m| m.data.len() - 6).sum();
        assert_eq!(body, 300);
    }

    #[test]
    fn test_long_private_command_prefix() {
        assert!(is_private_command(b'h', b"msg\x01bob hi"));
        assert!(!is_private_command(b'b', b"m\x01bob hi"));
        assert!(!is_private_command(b'h', b"mm\x01bob hi"));

        let packets = PacketEncoder::with_ceiling(5, 30).encode_standard(b'h', b"msg\x01bob one two three four");
        for packet in &packets {
            assert!(packet[2..].starts_with(b"msg\x01bob "));
        }
    }

    #[test]
    fn test_fill_from_scripted_reader() {
        let wire = PacketEncoder::new(5).encode_standard(b'b', b"bob\x01hello").concat();
        let (head, tail) = wire.split_at(4);
        let mut source = ScriptedReader {
            chunks: VecDeque::from(vec![head.to_vec(), tail.to_vec()]),
            eof: false,
        };

        let mut reader = PacketReader::new();
        let status = reader.fill_from(&mut source).unwrap();
        assert_eq!(status, FillStatus { bytes_read: wire.len(), closed: false });

        let msg = reader.try_parse_next().unwrap().unwrap();
        assert_eq!(msg.data, b"bob\x01hello");

        source.eof = true;
        assert!(reader.fill_from(&mut source).unwrap().closed);
    }

    #[test]
    fn test_buffer_limit() {
        let mut reader = PacketReader::new();
        reader.append_data(&vec![0u8; MAX_BUFFER_SIZE]).unwrap();
        let result = reader.append_data(&[0]);
        assert!(matches!(result, Err(FramingError::MessageTooLarge { .. })));
        assert_eq!(reader.buffer_size(), 0);
    }
}
