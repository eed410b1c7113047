//! 服务器消息的显示格式：聊天行、用户列表行、房间列表行

use crate::display::Render;
use crate::message::FIELD_SEPARATOR;
use chrono::{DateTime, Local, TimeZone};
use tracing::warn;

/// 房间名的最小显示宽度
const GROUP_NAME_WIDTH: usize = 30;

/// 作者名两侧的标记
pub(crate) fn author_marks(kind: u8) -> (&'static str, &'static str) {
    match kind {
        b'c' => ("*", "*"),
        b'd' => ("[=", "=]"),
        b'e' | b'k' => ("!", "!"),
        b'f' => ("{", "}"),
        _ => ("<", ">"),
    }
}

/// `[HH:MM:SS] <pre>作者<post> 正文`
pub(crate) fn chat_line(kind: u8, author: &str, text: Render, now: DateTime<Local>) -> Vec<Render> {
    let (pre, post) = author_marks(kind);
    vec![
        Render::Trusted(format!("{} {}", now.format("[%H:%M:%S]"), pre)),
        Render::untrusted(author),
        Render::Trusted(format!("{post} ")),
        text,
        Render::trusted("\n"),
    ]
}

/// 用户列表行 (`wl`)
///
/// 字段：版主标记、昵称、空闲秒数、恒为 0、登录时间戳、ident、来源地址。
/// 字段不全时输出到缺失处为止。
pub(crate) fn user_list_row(data: &str) -> Vec<Render> {
    let fields: Vec<&str> = data.split(FIELD_SEPARATOR as char).collect();
    if fields.len() < 2 {
        warn!("收到格式错误的用户信息行，忽略");
        return Vec::new();
    }

    let mut out = Vec::new();
    out.push(Render::trusted(if fields[0] == "m" { "*" } else { " " }));
    out.push(Render::untrusted(fields[1]));

    if let Some(idle) = fields.get(2) {
        out.push(Render::Trusted(format!(" {:>7}s", leading_number(idle))));

        let signon = fields.get(4).and_then(|s| s.parse::<i64>().ok());
        if let Some(time) = signon.and_then(|secs| Local.timestamp_opt(secs, 0).single()) {
            out.push(Render::Trusted(format!(" {}", time.format("%Y-%m-%d %H:%M:%S"))));

            if let Some(ident) = fields.get(5) {
                out.push(Render::trusted("\t"));
                out.push(Render::untrusted(*ident));
                if let Some(host) = fields.get(6) {
                    out.push(Render::trusted("\t"));
                    out.push(Render::untrusted(*host));
                }
            }
        }
    }

    out.push(Render::trusted("\n"));
    out
}

/// 房间列表行 (`wg`)：`名称\x01话题[\x01消息编号]`，当前房间标 `*`
pub(crate) fn group_list_row(data: &str, current_room: &str) -> Vec<Render> {
    let mut fields = data.splitn(3, FIELD_SEPARATOR as char);
    let (Some(name), Some(topic)) = (fields.next(), fields.next()) else {
        warn!("收到格式错误的房间信息行，忽略");
        return Vec::new();
    };
    let msgid = fields.next();

    let mut out = vec![
        Render::trusted(if name == current_room { "*" } else { " " }),
        Render::untrusted(name),
    ];
    let width = name.chars().count();
    if width < GROUP_NAME_WIDTH {
        out.push(Render::Trusted(" ".repeat(GROUP_NAME_WIDTH - width)));
    }
    if !topic.is_empty() {
        out.push(Render::trusted(" <"));
        out.push(Render::untrusted(topic));
        out.push(Render::trusted(">"));
    }
    if let Some(msgid) = msgid {
        out.push(Render::trusted(" ["));
        out.push(Render::untrusted(msgid));
        out.push(Render::trusted("]"));
    }
    out.push(Render::trusted("\n"));
    out
}

/// 字段开头的十进制整数，没有数字时为 0
fn leading_number(field: &str) -> i64 {
    let field = field.trim_start();
    let end = field
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map_or(field.len(), |(i, _)| i);
    field[..end].parse().unwrap_or(0)
}
