//! Scriptable HTTP/1.1 server for exercising the download engine
//!
//! Requests whose range has an explicit end (`bytes=0-10`) are treated as file
//! name probes. Every other request is a download attempt and consumes the
//! next scripted [`Reply`], falling back to the default once the script runs
//! out.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the server answers one download attempt
#[derive(Debug, Clone)]
pub enum Reply {
    /// Honor the range and send everything after it
    Full,
    /// Promise the full remainder but close after this many bytes
    DropAfter(usize),
    /// Serve at most this many bytes per response as a well-formed partial
    CapAt(usize),
    /// Ignore any range and send the whole body with 200
    IgnoreRange,
    /// Empty response with this status code
    Status(u16),
    /// Send the remainder without a Content-Length
    NoLength,
    /// Send this many bytes then hang
    Stall(usize),
    /// Answer 206 from this byte regardless of the requested range
    RangeFrom(usize),
}

/// One request as seen by the server
#[derive(Debug, Clone)]
pub struct Recorded {
    pub range: Option<String>,
    pub probe: bool,
}

struct State {
    body: Vec<u8>,
    script: VecDeque<Reply>,
    default: Reply,
    probe_status: u16,
    disposition: Option<String>,
    requests: Vec<Recorded>,
}

#[derive(Clone)]
pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub async fn start(body: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State {
            body,
            script: VecDeque::new(),
            default: Reply::Full,
            probe_status: 206,
            disposition: None,
            requests: Vec::new(),
        }));

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = handle(socket, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) -> &Self {
        self.state.lock().script.extend(replies);
        self
    }

    pub fn default_reply(&self, reply: Reply) -> &Self {
        self.state.lock().default = reply;
        self
    }

    pub fn disposition(&self, value: &str) -> &Self {
        self.state.lock().disposition = Some(value.to_string());
        self
    }

    pub fn probe_status(&self, status: u16) -> &Self {
        self.state.lock().probe_status = status;
        self
    }

    /// Range headers of every download attempt, in arrival order
    pub fn download_ranges(&self) -> Vec<Option<String>> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| !r.probe)
            .map(|r| r.range.clone())
            .collect()
    }

    pub fn probe_count(&self) -> usize {
        self.state.lock().requests.iter().filter(|r| r.probe).count()
    }
}

async fn handle(mut socket: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let head = read_head(&mut socket).await?;
    let range = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .map(|(_, value)| value.trim().to_string());

    let parsed = range.as_deref().and_then(parse_range);
    let probe = matches!(parsed, Some((_, Some(_))));

    let (body, reply, probe_status, disposition) = {
        let mut state = state.lock();
        state.requests.push(Recorded {
            range: range.clone(),
            probe,
        });
        let reply = if probe {
            Reply::Full
        } else {
            match state.script.pop_front() {
                Some(reply) => reply,
                None => state.default.clone(),
            }
        };
        (state.body.clone(), reply, state.probe_status, state.disposition.clone())
    };
    let len = body.len();

    if probe {
        let (start, end) = parsed.map(|(s, e)| (s, e.unwrap_or(0))).unwrap_or((0, 0));
        if probe_status >= 400 {
            return respond(&mut socket, probe_status, &[], &[]).await;
        }
        let end = end.min(len.saturating_sub(1));
        let slice = if start <= end && start < len { &body[start..=end] } else { &[][..] };
        let mut headers = vec![format!("Content-Range: bytes {}-{}/{}", start, end, len)];
        if let Some(value) = disposition {
            headers.push(format!("Content-Disposition: {}", value));
        }
        return respond(&mut socket, probe_status, &headers, slice).await;
    }

    let offset = parsed.map(|(s, _)| s).unwrap_or(0);
    match reply {
        Reply::Full | Reply::DropAfter(_) | Reply::Stall(_) => {
            if offset > 0 && offset >= len {
                let headers = [format!("Content-Range: bytes */{}", len)];
                return respond(&mut socket, 416, &headers, &[]).await;
            }
            let rest = &body[offset..];
            let (status, mut headers) = if offset > 0 {
                (206, vec![format!("Content-Range: bytes {}-{}/{}", offset, len - 1, len)])
            } else {
                (200, Vec::new())
            };
            headers.push(format!("Content-Length: {}", rest.len()));
            write_head(&mut socket, status, &headers).await?;

            match reply {
                Reply::DropAfter(n) => {
                    socket.write_all(&rest[..n.min(rest.len())]).await?;
                    socket.flush().await?;
                }
                Reply::Stall(n) => {
                    socket.write_all(&rest[..n.min(rest.len())]).await?;
                    socket.flush().await?;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                _ => socket.write_all(rest).await?,
            }
            socket.shutdown().await
        }
        Reply::CapAt(n) => {
            if offset >= len {
                let headers = [format!("Content-Range: bytes */{}", len)];
                return respond(&mut socket, 416, &headers, &[]).await;
            }
            let end = (offset + n).min(len);
            let headers = [format!("Content-Range: bytes {}-{}/{}", offset, end - 1, len)];
            respond(&mut socket, 206, &headers, &body[offset..end]).await
        }
        Reply::IgnoreRange => respond(&mut socket, 200, &[], &body).await,
        Reply::RangeFrom(start) => {
            let start = start.min(len.saturating_sub(1));
            let headers = [format!("Content-Range: bytes {}-{}/{}", start, len - 1, len)];
            respond(&mut socket, 206, &headers, &body[start..]).await
        }
        Reply::Status(code) => respond(&mut socket, code, &[], &[]).await,
        Reply::NoLength => {
            write_head(&mut socket, 200, &[]).await?;
            socket.write_all(&body[offset.min(len)..]).await?;
            socket.shutdown().await
        }
    }
}

async fn read_head(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `bytes=a-` or `bytes=a-b`
fn parse_range(value: &str) -> Option<(usize, Option<usize>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

async fn write_head(socket: &mut TcpStream, status: u16, headers: &[String]) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\nConnection: close\r\n", status, reason(status));
    for header in headers {
        head.push_str(header);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    socket.write_all(head.as_bytes()).await
}

async fn respond(socket: &mut TcpStream, status: u16, headers: &[String], body: &[u8]) -> std::io::Result<()> {
    let mut headers = headers.to_vec();
    headers.push(format!("Content-Length: {}", body.len()));
    write_head(socket, status, &headers).await?;
    socket.write_all(body).await?;
    socket.shutdown().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
