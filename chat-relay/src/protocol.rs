//! Line protocol spoken between the relay and its clients.
//!
//! Every message is one UTF-8 line. Server lines carry one of three prefixes
//! (`USERS `, `DM `, `SYS `) or none at all for public chat; client lines are
//! either a slash command or plain chat text.

use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const NICK_COMMAND: &str = "/nick";
pub const WHISPER_COMMAND: &str = "/w";

pub const USERS_PREFIX: &str = "USERS ";
pub const DM_PREFIX: &str = "DM ";
pub const SYS_PREFIX: &str = "SYS ";

/// Text of the system notices the relay sends.
pub mod notices {
    pub const WELCOME: &str = "Welcome! Set nickname with /nick <name>";
    pub const NICKNAME_TAKEN: &str = "Nickname already taken. Enter another:";
    pub const NICKNAME_EMPTY: &str = "Nickname cannot be empty. Enter another:";
    pub const INVALID_NICKNAME: &str = "Invalid or duplicate nickname.";
    pub const WHISPER_USAGE: &str = "Private message format: /w <nickname> <message>";
    pub const NICK_USAGE: &str = "Nickname format: /nick <newname>";

    pub fn joined(nickname: &str) -> String {
        format!("{nickname} has joined the chat.")
    }

    pub fn left(nickname: &str) -> String {
        format!("{nickname} has left the chat.")
    }

    pub fn renamed(old: &str, new: &str) -> String {
        format!("{old} changed nickname to {new}")
    }

    /// Confirmation echoed to the author of a private message.
    pub fn private_echo(target: &str, body: &str) -> String {
        format!("[Private to {target}] {body}")
    }
}

/// A line sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// Everyone currently online, in registry order.
    Users(Vec<String>),
    /// Private message, `<sender>: <body>`.
    Direct(String),
    /// Server-originated notice.
    System(String),
    /// Unprefixed text, usually `<sender>: <body>`.
    Chat(String),
}

impl ServerLine {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System(text.into())
    }

    pub fn public(sender: &str, body: &str) -> Self {
        Self::Chat(format!("{sender}: {body}"))
    }

    pub fn direct(sender: &str, body: &str) -> Self {
        Self::Direct(format!("{sender}: {body}"))
    }

    /// Classifies a raw line by its prefix, most specific first.
    pub fn parse(line: &str) -> Self {
        if let Some(users) = line.strip_prefix(USERS_PREFIX) {
            let users = users.trim();
            if users.is_empty() {
                return Self::Users(Vec::new());
            }
            return Self::Users(users.split(',').map(str::to_string).collect());
        }
        if let Some(direct) = line.strip_prefix(DM_PREFIX) {
            return Self::Direct(direct.to_string());
        }
        if let Some(notice) = line.strip_prefix(SYS_PREFIX) {
            return Self::System(notice.to_string());
        }
        Self::Chat(line.to_string())
    }
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Users(users) => write!(f, "{USERS_PREFIX}{}", users.join(",")),
            Self::Direct(text) => write!(f, "{DM_PREFIX}{text}"),
            Self::System(text) => write!(f, "{SYS_PREFIX}{text}"),
            Self::Chat(text) => f.write_str(text),
        }
    }
}

/// Returns the text following `command` when `line` invokes it.
///
/// `/nick`, `/nick bob` and `/nick\tbob` all invoke `/nick`; `/nickname` does
/// not. The returned argument keeps its leading whitespace.
pub fn command_argument<'a>(line: &'a str, command: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(command)?;
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest),
        Some(_) => None,
    }
}

/// Nickname proposed by a handshake line: the `/nick` argument if present,
/// otherwise the whole line, trimmed either way.
pub fn proposed_nickname(line: &str) -> &str {
    command_argument(line, NICK_COMMAND).unwrap_or(line).trim()
}

/// Reads one line, without its terminator. `Ok(None)` means end of stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let len = line.trim_end_matches(LINE_ENDINGS).len();
    line.truncate(len);
    Ok(Some(line))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per line plus a flush, so peers see each message promptly.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
