//! Minimal HTTP/1.1 server supporting HEAD and ranged GET, for integration tests.
//!
//! Serves one static body. Every response closes the connection.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// If false, HEAD returns 405.
    pub head_allowed: bool,
    /// If false, GET ignores `Range` and returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, no `Content-Length` or `Content-Range` is ever sent.
    pub report_length: bool,
    /// If set, bodies are written in 1 KiB pieces with this pause between them.
    pub drip: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            report_length: true,
            drip: None,
        }
    }
}

pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, ServerOptions::default())
}

/// Serve `body` from a background thread; returns the URL to fetch.
pub fn start_with_options(body: Vec<u8>, opts: ServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            thread::spawn(move || handle(stream, &body, opts));
        }
    });
    format!("http://127.0.0.1:{}/media.bin", port)
}

fn handle(mut stream: TcpStream, body: &[u8], opts: ServerOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else { return };
    let (method, range) = parse_request(request);
    let total = body.len() as u64;

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            return;
        }
        let length = if opts.report_length {
            format!("Content-Length: {}\r\n", total)
        } else {
            String::new()
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\n{}Accept-Ranges: bytes\r\nConnection: close\r\n\r\n",
            length
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }

    let (status, content_range, slice) = match range {
        Some((start, end_incl)) if opts.support_ranges && start < total => {
            let end_excl = end_incl.saturating_add(1).min(total);
            (
                "206 Partial Content",
                Some(format!("bytes {}-{}/{}", start, end_excl - 1, total)),
                &body[start as usize..end_excl as usize],
            )
        }
        _ => ("200 OK", None, body),
    };

    let mut headers = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
    if opts.report_length {
        headers.push_str(&format!("Content-Length: {}\r\n", slice.len()));
        if let Some(cr) = content_range {
            headers.push_str(&format!("Content-Range: {}\r\n", cr));
        }
    }
    headers.push_str("\r\n");
    if stream.write_all(headers.as_bytes()).is_err() {
        return;
    }

    match opts.drip {
        None => {
            let _ = stream.write_all(slice);
        }
        Some(pause) => {
            for piece in slice.chunks(1024) {
                if stream.write_all(piece).is_err() || stream.flush().is_err() {
                    return;
                }
                thread::sleep(pause);
            }
        }
    }
}

/// Returns the method and an optional inclusive `(start, end)` from `Range: bytes=X-Y`.
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut lines = request.lines();
    let method = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("");
    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                if let Some(spec) = value.trim().strip_prefix("bytes=") {
                    if let Some((a, b)) = spec.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim().parse::<u64>().unwrap_or(u64::MAX);
                        range = Some((start, end));
                    }
                }
            }
        }
    }
    (method, range)
}
