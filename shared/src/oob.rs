//! Out-of-band (connectionless) packets.
//!
//! A connectionless datagram starts with four `0xff` bytes followed by a
//! single line of text. Sequenced session traffic can never start with that
//! pattern because the high bit of the sequence word is only the reliable
//! flag and the sequence itself never reaches `0x7fffffff` in practice.

pub const SENTINEL: [u8; 4] = [0xff; 4];

pub fn is_connectionless(data: &[u8]) -> bool {
    data.len() >= SENTINEL.len() && data[..SENTINEL.len()] == SENTINEL
}

/// Frames `text` as an out-of-band datagram.
pub fn encode(text: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(SENTINEL.len() + text.len());
    packet.extend_from_slice(&SENTINEL);
    packet.extend_from_slice(text.as_bytes());
    packet
}

/// Returns the whole text body of an out-of-band datagram.
pub fn body(data: &[u8]) -> Option<String> {
    if !is_connectionless(data) {
        return None;
    }
    let text = &data[SENTINEL.len()..];
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    Some(String::from_utf8_lossy(&text[..end]).into_owned())
}

/// Returns the first line of an out-of-band datagram, which carries the
/// command and its arguments.
pub fn command_line(data: &[u8]) -> Option<String> {
    body(data).map(|text| match text.find('\n') {
        Some(end) => text[..end].to_string(),
        None => text,
    })
}

/// Splits a command line into arguments.
///
/// Whitespace separates arguments, double quotes group them, and a `//`
/// outside quotes ends the line.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let Some(&c) = chars.peek() else {
            break;
        };

        if c == '"' {
            chars.next();
            let mut arg = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                arg.push(c);
            }
            args.push(arg);
            continue;
        }

        if c == '/' {
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek() == Some(&'/') {
                break;
            }
        }

        let mut arg = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '"' {
                break;
            }
            arg.push(c);
            chars.next();
        }
        args.push(arg);
    }

    args
}

/// Everything after the first `skip` arguments, as typed.
///
/// Used by `rcon`, whose command text must reach the console untouched.
pub fn args_from(line: &str, skip: usize) -> String {
    let mut rest = line.trim_start();
    for _ in 0..skip {
        if rest.starts_with('"') {
            match rest[1..].find('"') {
                Some(end) => rest = &rest[end + 2..],
                None => return String::new(),
            }
        } else {
            match rest.find(char::is_whitespace) {
                Some(end) => rest = &rest[end..],
                None => return String::new(),
            }
        }
        rest = rest.trim_start();
    }
    rest.trim_end().to_string()
}
