//! Connectionless queries.

use crate::ClientError;
use log::debug;
use shared::{oob, InfoString, MAX_MSGLEN, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// One player line of a status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStatus {
    pub score: i32,
    pub ping: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub info: InfoString,
    pub players: Vec<PlayerStatus>,
}

/// Parses the body of a status reply, with or without its `print` line.
pub fn parse_status(body: &str) -> Result<ServerStatus, ClientError> {
    let body = body.strip_prefix("print\n").unwrap_or(body);
    let mut lines = body.lines();
    let info_line = lines
        .next()
        .ok_or_else(|| ClientError::UnexpectedReply(body.to_string()))?;
    let info = InfoString::parse(info_line)?;

    let mut players = Vec::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let args = oob::tokenize(line);
        let parsed = match args.as_slice() {
            [score, ping, name] => score
                .parse()
                .ok()
                .zip(ping.parse().ok())
                .map(|(score, ping)| PlayerStatus {
                    score,
                    ping,
                    name: name.clone(),
                }),
            _ => None,
        };
        match parsed {
            Some(player) => players.push(player),
            None => return Err(ClientError::UnexpectedReply(line.to_string())),
        }
    }

    Ok(ServerStatus { info, players })
}

/// Sends one out-of-band request on `socket` and waits for the next
/// out-of-band reply from `server`. Returns the reply body.
pub async fn request_on(
    socket: &UdpSocket,
    server: SocketAddr,
    text: &str,
    wait: Duration,
) -> Result<String, ClientError> {
    socket.send_to(&oob::encode(text), server).await?;
    receive_on(socket, server, wait).await
}

/// Waits for the next out-of-band packet from `server`.
pub async fn receive_on(
    socket: &UdpSocket,
    server: SocketAddr,
    wait: Duration,
) -> Result<String, ClientError> {
    let mut buffer = vec![0u8; MAX_MSGLEN * 2];
    let deadline = Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let (len, from) = timeout(left, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| ClientError::Timeout(server))??;
        if from != server {
            debug!("Ignoring packet from {}", from);
            continue;
        }
        if let Some(body) = oob::body(&buffer[..len]) {
            return Ok(body);
        }
    }
}

async fn request(server: SocketAddr, text: &str, wait: Duration) -> Result<String, ClientError> {
    let socket = UdpSocket::bind(local_bind_address(server)).await?;
    request_on(&socket, server, text, wait).await
}

/// Wildcard address of the same family as `server`.
pub fn local_bind_address(server: SocketAddr) -> &'static str {
    if server.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    }
}

pub async fn status(server: SocketAddr, wait: Duration) -> Result<ServerStatus, ClientError> {
    let body = request(server, "status", wait).await?;
    parse_status(&body)
}

/// The one-line `info` summary. Single-player servers never answer.
pub async fn info(server: SocketAddr, wait: Duration) -> Result<String, ClientError> {
    let body = request(server, &format!("info {}", PROTOCOL_VERSION), wait).await?;
    match body.strip_prefix("info\n") {
        Some(text) => Ok(text.trim_end().to_string()),
        None => Err(ClientError::UnexpectedReply(body)),
    }
}

/// Round trip of a `ping`/`ack` exchange.
pub async fn ping(server: SocketAddr, wait: Duration) -> Result<Duration, ClientError> {
    let start = Instant::now();
    let body = request(server, "ping", wait).await?;
    if body.trim_end() != "ack" {
        return Err(ClientError::UnexpectedReply(body));
    }
    Ok(start.elapsed())
}

pub async fn get_challenge_on(
    socket: &UdpSocket,
    server: SocketAddr,
    wait: Duration,
) -> Result<i32, ClientError> {
    let body = request_on(socket, server, "getchallenge", wait).await?;
    let args = oob::tokenize(&body);
    match args.as_slice() {
        [command, challenge] if command == "challenge" => challenge
            .parse()
            .map_err(|_| ClientError::UnexpectedReply(body.clone())),
        _ => Err(ClientError::UnexpectedReply(body)),
    }
}

/// Runs a console command over rcon. Collects `print` replies until the
/// server goes quiet for `wait`.
pub async fn rcon(
    server: SocketAddr,
    password: &str,
    command: &str,
    wait: Duration,
) -> Result<String, ClientError> {
    let socket = UdpSocket::bind(local_bind_address(server)).await?;
    let first = request_on(&socket, server, &format!("rcon \"{}\" {}", password, command), wait).await?;

    let mut output = String::new();
    let mut reply = Ok(first);
    while let Ok(body) = reply {
        match body.strip_prefix("print\n") {
            Some(text) => output.push_str(text),
            None => return Err(ClientError::UnexpectedReply(body)),
        }
        reply = receive_on(&socket, server, wait).await;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let body = "print\n\\hostname\\arena\\mapname\\q2dm1\n12 48 \"alpha\"\n0 999 \"two words\"\n";
        let status = parse_status(body).unwrap();
        assert_eq!(status.info.value_for_key("mapname"), Some("q2dm1"));
        assert_eq!(
            status.players,
            vec![
                PlayerStatus {
                    score: 12,
                    ping: 48,
                    name: "alpha".to_string()
                },
                PlayerStatus {
                    score: 0,
                    ping: 999,
                    name: "two words".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_status_without_players() {
        let status = parse_status("\\hostname\\arena\n").unwrap();
        assert!(status.players.is_empty());
        assert!(parse_status("").is_err());
        assert!(parse_status("\\hostname\\arena\nnot a player line at all\n").is_err());
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = silent.local_addr().unwrap();
        let result = ping(server, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ClientError::Timeout(addr)) if addr == server));
    }

    #[tokio::test]
    async fn test_challenge_exchange() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = server_socket.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buffer = [0u8; 64];
            let (len, from) = server_socket.recv_from(&mut buffer).await.unwrap();
            assert_eq!(oob::body(&buffer[..len]).as_deref(), Some("getchallenge"));
            server_socket
                .send_to(&oob::encode("challenge 4242"), from)
                .await
                .unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let challenge = get_challenge_on(&socket, server, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(challenge, 4242);
        responder.await.unwrap();
    }
}
