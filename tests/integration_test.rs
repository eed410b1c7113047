use icb_client::config::Config;
use icb_client::event_loop::Client;
use icb_client::framing::{Encoding, PacketEncoder, PacketReader};
use icb_client::history::HistorySink;
use icb_client::message::{IcbMessage, MessageKind};
use icb_client::queue::{DrainStatus, OutboundTask, OutputQueue};
use icb_client::session::{Effect, ExitReason, FeatureSet, Identity, Session, SessionState};
use std::cell::Cell;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

/// 服务器方向的数据包（服务器不需要给昵称留空间）
fn packet(kind: MessageKind, data: &[u8]) -> Vec<u8> {
    PacketEncoder::new(0).encode_standard(kind.code(), data).concat()
}

/// 阻塞读取下一个完整消息
fn read_message(stream: &mut TcpStream, reader: &mut PacketReader) -> IcbMessage {
    loop {
        if let Some(msg) = reader.try_parse_next().expect("客户端发送了无效数据") {
            return msg;
        }
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).expect("读取客户端数据失败");
        assert!(n > 0, "客户端提前断开");
        reader.append_data(&buf[..n]).unwrap();
    }
}

fn test_config(port: u16, history_dir: Option<PathBuf>) -> Config {
    Config {
        nick: "alice".into(),
        host: "127.0.0.1".into(),
        port,
        room: "lobby".into(),
        idle_interval: Duration::from_secs(5),
        history_dir,
        encoding: Encoding::Standard,
        verbosity: 0,
    }
}

/// 握手并确认登录请求
fn accept_login(listener: &TcpListener) -> (TcpStream, PacketReader) {
    let (mut stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(&packet(MessageKind::Protocol, b"1\x01host\x01test-server")).unwrap();

    let mut reader = PacketReader::new();
    let login = read_message(&mut stream, &mut reader);
    assert_eq!(login.kind(), MessageKind::Login);
    assert_eq!(login.data, b"alice\x01alice\x01lobby\x01login\x01");
    stream.write_all(&packet(MessageKind::Login, b"")).unwrap();
    (stream, reader)
}

#[test]
fn test_login_conversation_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Identity {
        nick: "alice".into(),
        room: "lobby".into(),
        host: "icb.example.net".into(),
    };
    let mut session = Session::new(identity, FeatureSet::default());
    let encoder = PacketEncoder::new("alice".len());
    let mut history = HistorySink::new(dir.path(), "lobby");
    let mut net = OutputQueue::new();
    let sent = Rc::new(Cell::new(0));

    // 服务器发来的字节流被拆成两半到达
    let mut wire = packet(MessageKind::Protocol, b"1");
    let mut reader = PacketReader::new();
    reader.append_data(&wire[..1]).unwrap();
    assert!(reader.try_parse_next().unwrap().is_none());
    reader.append_data(&wire.split_off(1)).unwrap();

    session.on_connected();
    let protocol = reader.try_parse_next().unwrap().unwrap();
    for effect in session.handle_message(&protocol).unwrap() {
        if let Effect::Transmit(msg) = effect {
            for bytes in encoder.encode(session.encoding(), msg.kind, &msg.data) {
                let counter = Rc::clone(&sent);
                net.enqueue(OutboundTask::with_callback(bytes, move |_| counter.set(counter.get() + 1)));
            }
        }
    }
    assert_eq!(session.state(), SessionState::LoginSent);

    let mut socket = Vec::new();
    assert_eq!(net.drain(&mut socket).unwrap(), DrainStatus::Drained);
    assert_eq!(sent.get(), 1);
    assert_eq!(socket, packet(MessageKind::Login, b"alice\x01alice\x01lobby\x01login\x01"));

    reader.append_data(&packet(MessageKind::Login, b"")).unwrap();
    reader.append_data(&packet(MessageKind::Open, b"bob\x01hi alice")).unwrap();
    while let Some(msg) = reader.try_parse_next().unwrap() {
        for effect in session.handle_message(&msg).unwrap() {
            if let Effect::Log(entry) = effect {
                history.record(&entry);
            }
        }
    }
    for effect in session.submit_line("hi bob") {
        if let Effect::Log(entry) = effect {
            history.record(&entry);
        }
    }
    history.flush(|_| true);

    let log = fs::read_to_string(dir.path().join("room-lobby.log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(" bob: hi alice"));
    assert!(lines[1].ends_with(" me: hi bob"));
}

#[test]
fn test_client_session_until_farewell() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (mut stream, _) = accept_login(&listener);
        stream.write_all(&packet(MessageKind::Open, b"bob\x01hello")).unwrap();
        stream.write_all(&packet(MessageKind::Exit, b"")).unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    let logs = tempfile::tempdir().unwrap();
    let (stdin_ours, _stdin_theirs) = UnixStream::pair().unwrap();
    let (stdout_ours, mut stdout_theirs) = UnixStream::pair().unwrap();

    let config = test_config(port, Some(logs.path().join("127.0.0.1")));
    let mut client = Client::with_terminal(
        &config,
        Arc::new(AtomicBool::new(false)),
        stdin_ours.as_raw_fd(),
        stdout_ours.as_raw_fd(),
    )
    .unwrap();

    let reason = client.run().unwrap();
    assert_eq!(reason, ExitReason::ServerFarewell);
    assert!(client.stats().packets_sent >= 1);
    assert_eq!(client.stats().messages_received, 4);

    drop(client);
    drop(stdout_ours);
    let mut output = String::new();
    stdout_theirs.read_to_string(&mut output).unwrap();
    assert!(output.contains("Connecting to 127.0.0.1 ... connected\n"), "{output}");
    assert!(output.contains("Logged in to room lobby as alice\n"), "{output}");
    assert!(output.contains("<bob> hello\n"), "{output}");
    assert!(output.contains("ICB: server said bye-bye\n"), "{output}");

    let room_log = fs::read_to_string(logs.path().join("127.0.0.1").join("room-lobby.log")).unwrap();
    assert!(room_log.ends_with(" bob: hello\n"), "{room_log}");

    server.join().unwrap();
}

#[test]
fn test_client_input_ping_and_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (stdin_ours, mut stdin_theirs) = UnixStream::pair().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, mut reader) = accept_login(&listener);

        stdin_theirs.write_all(b"hello all\n").unwrap();
        let public = read_message(&mut stream, &mut reader);
        assert_eq!(public.kind(), MessageKind::Open);
        assert_eq!(public.data, b"hello all");

        stream.write_all(&packet(MessageKind::Ping, b"7")).unwrap();
        let pong = read_message(&mut stream, &mut reader);
        assert_eq!(pong.kind(), MessageKind::Pong);
        assert_eq!(pong.data, b"7");

        // 关闭连接，保持标准输入不结束
        drop(stream);
        stdin_theirs
    });

    let (stdout_ours, mut stdout_theirs) = UnixStream::pair().unwrap();
    let config = test_config(port, None);
    let mut client = Client::with_terminal(
        &config,
        Arc::new(AtomicBool::new(false)),
        stdin_ours.as_raw_fd(),
        stdout_ours.as_raw_fd(),
    )
    .unwrap();

    let reason = client.run().unwrap();
    assert_eq!(reason, ExitReason::ConnectionClosed);
    assert!(!reason.is_failure());
    assert_eq!(client.stats().lines_submitted, 1);

    drop(client);
    drop(stdout_ours);
    let mut output = String::new();
    stdout_theirs.read_to_string(&mut output).unwrap();
    assert!(output.contains("Server 127.0.0.1 closed connection, exiting...\n"), "{output}");

    let _stdin = server.join().unwrap();
}
