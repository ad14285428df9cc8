//! Scripted [`Transport`] for pipeline tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};

use crate::subset::ByteRange;
use crate::transport::{BodyStream, Transport, TransportError, TransportResponse, empty_body};

pub(crate) const BOUNDARY: &str = "grib_fetch_test_boundary";

#[derive(Debug, Clone)]
enum Route {
    File { data: Bytes, ranges: bool },
    Status(u16),
}

#[derive(Default)]
struct State {
    routes: HashMap<String, Route>,
    head_status: HashMap<String, u16>,
    fail_next: HashMap<String, u32>,
    truncate_next: HashMap<String, u32>,
    pause: HashMap<String, Duration>,
    log: Vec<String>,
}

/// Unknown URLs answer 404.
#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<State>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` with range support.
    pub fn serve(&self, url: &str, data: impl Into<Bytes>) -> &Self {
        self.route(url, Route::File { data: data.into(), ranges: true })
    }

    /// Serve `data`, ignoring `Range` headers.
    pub fn serve_without_ranges(&self, url: &str, data: impl Into<Bytes>) -> &Self {
        self.route(url, Route::File { data: data.into(), ranges: false })
    }

    /// Answer every request for `url` with `status`.
    pub fn status(&self, url: &str, status: u16) -> &Self {
        self.route(url, Route::Status(status))
    }

    /// Answer HEAD requests for `url` with `status`, GET stays as routed.
    pub fn head_status(&self, url: &str, status: u16) -> &Self {
        self.state.lock().unwrap().head_status.insert(url.to_string(), status);
        self
    }

    /// The next `n` requests for `url` fail with a connection error.
    pub fn fail_next(&self, url: &str, n: u32) -> &Self {
        self.state.lock().unwrap().fail_next.insert(url.to_string(), n);
        self
    }

    /// The next `n` GETs for `url` return one byte less than asked for.
    pub fn truncate_next(&self, url: &str, n: u32) -> &Self {
        self.state.lock().unwrap().truncate_next.insert(url.to_string(), n);
        self
    }

    /// GET bodies for `url` wait `pause` before each chunk after the first.
    pub fn throttle(&self, url: &str, pause: Duration) -> &Self {
        self.state.lock().unwrap().pause.insert(url.to_string(), pause);
        self
    }

    /// Every request seen, as `"METHOD url [range]"`.
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn count(&self, method: &str, url: &str) -> usize {
        let prefix = format!("{method} {url}");
        self.requests()
            .iter()
            .filter(|r| **r == prefix || r.starts_with(&format!("{prefix} ")))
            .count()
    }

    fn route(&self, url: &str, route: Route) -> &Self {
        self.state.lock().unwrap().routes.insert(url.to_string(), route);
        self
    }

    fn take(counter: &mut HashMap<String, u32>, url: &str) -> bool {
        match counter.get_mut(url) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

fn response(
    status: u16,
    content_type: Option<String>,
    total: Option<u64>,
    body: Bytes,
) -> TransportResponse {
    let len = body.len() as u64;
    let body: BodyStream = if body.is_empty() {
        empty_body()
    } else {
        // two chunks to exercise streaming writes
        let mid = body.len() / 2;
        Box::pin(stream::iter(vec![Ok(body.slice(..mid)), Ok(body.slice(mid..))]))
    };
    TransportResponse {
        status,
        content_type,
        content_length: Some(len),
        total_length: total,
        accept_ranges: status == 206,
        body,
    }
}

fn throttled(body: BodyStream, pause: Duration) -> BodyStream {
    Box::pin(body.enumerate().then(move |(i, chunk)| async move {
        if i > 0 {
            tokio::time::sleep(pause).await;
        }
        chunk
    }))
}

fn slice(data: &Bytes, r: &ByteRange) -> Option<Bytes> {
    let len = data.len() as u64;
    if r.start >= len {
        return None;
    }
    let end = r.end.map_or(len - 1, |e| e.min(len - 1));
    Some(data.slice(r.start as usize..=end as usize))
}

#[async_trait]
impl Transport for MockTransport {
    async fn head(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let mut st = self.state.lock().unwrap();
        st.log.push(format!("HEAD {url}"));
        if Self::take(&mut st.fail_next, url) {
            return Err(TransportError::Connection("connection reset".into()));
        }
        if let Some(status) = st.head_status.get(url) {
            return Ok(response(*status, None, None, Bytes::new()));
        }
        Ok(match st.routes.get(url) {
            Some(Route::File { data, ranges }) => {
                let mut r = response(200, None, Some(data.len() as u64), Bytes::new());
                r.content_length = Some(data.len() as u64);
                r.accept_ranges = *ranges;
                r
            }
            Some(Route::Status(s)) => response(*s, None, None, Bytes::new()),
            None => response(404, None, None, Bytes::new()),
        })
    }

    async fn get(
        &self,
        url: &str,
        ranges: &[ByteRange],
    ) -> Result<TransportResponse, TransportError> {
        let pause = self.state.lock().unwrap().pause.get(url).copied();
        let mut resp = self.answer_get(url, ranges)?;
        if let Some(pause) = pause {
            resp.body = throttled(resp.body, pause);
        }
        Ok(resp)
    }
}

impl MockTransport {
    fn answer_get(
        &self,
        url: &str,
        ranges: &[ByteRange],
    ) -> Result<TransportResponse, TransportError> {
        let mut st = self.state.lock().unwrap();
        let rendered: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
        if rendered.is_empty() {
            st.log.push(format!("GET {url}"));
        } else {
            st.log.push(format!("GET {url} {}", rendered.join(",")));
        }
        if Self::take(&mut st.fail_next, url) {
            return Err(TransportError::Connection("connection reset".into()));
        }
        let truncate = Self::take(&mut st.truncate_next, url);

        let (data, supports_ranges) = match st.routes.get(url) {
            Some(Route::File { data, ranges }) => (data.clone(), *ranges),
            Some(Route::Status(s)) => return Ok(response(*s, None, None, Bytes::new())),
            None => return Ok(response(404, None, None, Bytes::new())),
        };
        let total = Some(data.len() as u64);
        let cut = |b: Bytes| if truncate && !b.is_empty() { b.slice(..b.len() - 1) } else { b };

        if ranges.is_empty() || !supports_ranges {
            return Ok(response(200, None, total, cut(data)));
        }

        if let [single] = ranges {
            return Ok(match slice(&data, single) {
                Some(part) => response(206, None, total, cut(part)),
                None => response(416, None, None, Bytes::new()),
            });
        }

        let mut body = BytesMut::new();
        for r in ranges {
            let Some(part) = slice(&data, r) else {
                return Ok(response(416, None, None, Bytes::new()));
            };
            let end = r.start + part.len() as u64 - 1;
            body.extend_from_slice(
                format!(
                    "\r\n--{BOUNDARY}\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes {}-{end}/{}\r\n\r\n",
                    r.start,
                    data.len()
                )
                .as_bytes(),
            );
            body.extend_from_slice(&part);
        }
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Ok(response(
            206,
            Some(format!("multipart/byteranges; boundary={BOUNDARY}")),
            total,
            cut(body.freeze()),
        ))
    }
}

/// A fake GRIB2 message of `len` bytes: indicator section, filler, `7777`.
pub(crate) fn grib_message(len: usize, fill: u8) -> Vec<u8> {
    let len = len.max(20);
    let mut m = b"GRIB".to_vec();
    m.extend_from_slice(&[0, 0, 0, 2]);
    m.extend_from_slice(&(len as u64).to_be_bytes());
    m.resize(len - 4, fill);
    m.extend_from_slice(b"7777");
    m
}

/// Concatenated messages plus the wgrib2 index describing them.
pub(crate) fn grib_file(fields: &[(&str, &str, usize)]) -> (Vec<u8>, String) {
    let mut data = Vec::new();
    let mut idx = String::new();
    for (i, (var, level, len)) in fields.iter().enumerate() {
        idx.push_str(&format!(
            "{}:{}:d=2024010100:{var}:{level}:6 hour fcst:\n",
            i + 1,
            data.len()
        ));
        data.extend(grib_message(*len, b'a' + i as u8));
    }
    (data, idx)
}
