//! Minimal HTTP/1.1 server with HEAD and Range GET support for integration
//! tests.
//!
//! Serves one static body for every path. Behavior is configurable: HEAD can
//! be blocked, ranges can be ignored or unadvertised, the first N GETs can
//! answer 503, and body writes can be throttled to open pause/cancel
//! windows. The handle exposes request counters so tests can assert on the
//! traffic the engine produced.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If false, omit `Accept-Ranges: bytes` even if ranges work.
    pub advertise_ranges: bool,
    /// The first N GET requests answer 503 before the server behaves.
    pub fail_first: u32,
    /// Sleep between 16 KiB body slices.
    pub write_delay: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            advertise_ranges: true,
            fail_first: 0,
            write_delay: None,
        }
    }
}

pub struct ServerHandle {
    /// Base URL, e.g. "http://127.0.0.1:12345/".
    pub url: String,
    /// Number of GET requests seen (503-failed ones included).
    pub get_count: Arc<AtomicU32>,
    /// High-water mark of concurrently served requests.
    pub max_concurrent: Arc<AtomicUsize>,
}

pub fn start(body: Vec<u8>) -> ServerHandle {
    start_with_options(body, ServerOptions::default())
}

/// Starts a server in a background thread serving `body`. Runs until the
/// process exits.
pub fn start_with_options(body: Vec<u8>, opts: ServerOptions) -> ServerHandle {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let get_count = Arc::new(AtomicU32::new(0));
    let fail_budget = Arc::new(AtomicU32::new(opts.fail_first));
    let current = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));

    let handle = ServerHandle {
        url: format!("http://127.0.0.1:{}/", port),
        get_count: Arc::clone(&get_count),
        max_concurrent: Arc::clone(&max_concurrent),
    };

    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let get_count = Arc::clone(&get_count);
            let fail_budget = Arc::clone(&fail_budget);
            let current = Arc::clone(&current);
            let max_concurrent = Arc::clone(&max_concurrent);
            thread::spawn(move || {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                handle_connection(stream, &body, opts, &get_count, &fail_budget);
                current.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    handle
}

fn handle_connection(
    mut stream: TcpStream,
    body: &[u8],
    opts: ServerOptions,
    get_count: &AtomicU32,
    fail_budget: &AtomicU32,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    let total = body.len() as u64;

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
            total,
            accept_ranges_header(opts)
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if method.eq_ignore_ascii_case("GET") {
        get_count.fetch_add(1, Ordering::SeqCst);

        let failing = fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let _ = stream.write_all(
                b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }

        match range.filter(|_| opts.support_ranges) {
            Some((start, end_incl)) => {
                if start >= total {
                    let response = format!(
                        "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        total
                    );
                    let _ = stream.write_all(response.as_bytes());
                    return;
                }
                let end_incl = end_incl.min(total.saturating_sub(1));
                let slice = &body[start as usize..=end_incl as usize];
                let response = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n{}Connection: close\r\n\r\n",
                    slice.len(),
                    start,
                    end_incl,
                    total,
                    accept_ranges_header(opts)
                );
                let _ = stream.write_all(response.as_bytes());
                write_body(&mut stream, slice, opts.write_delay);
            }
            None => {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
                    total,
                    accept_ranges_header(opts)
                );
                let _ = stream.write_all(response.as_bytes());
                write_body(&mut stream, body, opts.write_delay);
            }
        }
        return;
    }

    let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
}

fn accept_ranges_header(opts: ServerOptions) -> &'static str {
    if opts.advertise_ranges && opts.support_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    }
}

fn write_body(stream: &mut TcpStream, slice: &[u8], delay: Option<Duration>) {
    for piece in slice.chunks(16 * 1024) {
        if stream.write_all(piece).is_err() {
            return;
        }
        if let Some(d) = delay {
            thread::sleep(d);
        }
    }
}

/// Returns (method, optional (start, end_inclusive) from `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(part) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
