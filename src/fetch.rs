//! Ranged and full downloads with retry, written atomically.
//!
//! Data is written to `<destination>.partial` and renamed into place once
//! every byte has arrived and been checked. Any failure or cancellation
//! removes the partial file, so a destination path either holds a complete
//! result or nothing.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::registry::RangeStrategy;
use crate::subset::ByteRange;
use crate::transport::{Transport, TransportError, TransportResponse, read_body};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResult {
    pub bytes_written: u64,
    /// GRIB messages found walking the written data.
    pub messages_included: usize,
}

/// Why one attempt failed.
#[derive(Debug)]
struct AttemptError {
    retryable: bool,
    reason: String,
}

impl AttemptError {
    fn transient(reason: impl Into<String>) -> Self {
        Self {
            retryable: true,
            reason: reason.into(),
        }
    }

    fn fatal(reason: impl Into<String>) -> Self {
        Self {
            retryable: false,
            reason: reason.into(),
        }
    }

    fn status(status: u16) -> Self {
        let retryable = status == 408 || status == 429 || (500..600).contains(&status);
        Self {
            retryable,
            reason: format!("HTTP {status}"),
        }
    }
}

impl From<TransportError> for AttemptError {
    fn from(e: TransportError) -> Self {
        Self {
            retryable: e.is_retryable(),
            reason: e.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            transport,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Download `ranges` of `url` (or the whole file when `ranges` is empty
    /// or the provider cannot serve ranges) into `destination`.
    #[instrument(skip(self, ranges, destination, cancel), fields(ranges = ranges.len()))]
    pub async fn fetch(
        &self,
        url: &str,
        ranges: &[ByteRange],
        strategy: RangeStrategy,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchResult> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(destination);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = self.write_partial(url, ranges, strategy, &partial) => r,
        };

        match outcome {
            Ok(result) => {
                fs::rename(&partial, destination).await?;
                debug!(
                    bytes = result.bytes_written,
                    messages = result.messages_included,
                    "fetch complete"
                );
                Ok(result)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&partial).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %rm, "cannot remove partial file");
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_partial(
        &self,
        url: &str,
        ranges: &[ByteRange],
        strategy: RangeStrategy,
        partial: &Path,
    ) -> Result<FetchResult> {
        if ranges.is_empty() || strategy == RangeStrategy::None {
            return self.download_full(url, partial).await;
        }
        if strategy == RangeStrategy::MultiRange && ranges.len() > 1 {
            match self.get_multi(url, ranges).await? {
                Some(parts) => return write_parts(partial, parts).await,
                None => debug!(url, "no multipart answer, fetching ranges one by one"),
            }
        }

        let mut bodies = stream::iter(ranges.iter().copied())
            .map(|r| self.get_range(url, r))
            .buffered(self.concurrency);

        let mut file = File::create(partial).await?;
        let mut walker = MessageWalker::default();
        let mut written = 0u64;
        while let Some(body) = bodies.next().await {
            let body = body?;
            walker.restart();
            walker.feed(&body);
            file.write_all(&body).await?;
            written += body.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(FetchResult {
            bytes_written: written,
            messages_included: walker.total(),
        })
    }

    async fn download_full(&self, url: &str, partial: &Path) -> Result<FetchResult> {
        self.with_retry(url, |_| async move {
            let resp = self.transport.get(url, &[]).await?;
            if resp.status != 200 {
                return Err(AttemptError::status(resp.status));
            }
            let expected = resp.content_length;

            let io = |e: std::io::Error| AttemptError::fatal(e.to_string());
            let mut file = File::create(partial).await.map_err(io)?;
            let mut walker = MessageWalker::default();
            let mut written = 0u64;
            let mut body = resp.body;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                walker.feed(&chunk);
                file.write_all(&chunk).await.map_err(io)?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(io)?;
            file.sync_all().await.map_err(io)?;

            if let Some(expected) = expected {
                if expected != written {
                    return Err(AttemptError::transient(format!(
                        "short body: {written} of {expected} bytes"
                    )));
                }
            }
            if written < 4 || !walker.saw_grib() {
                return Err(AttemptError::fatal("response is not GRIB data"));
            }
            Ok(FetchResult {
                bytes_written: written,
                messages_included: walker.total(),
            })
        })
        .await
    }

    async fn get_range(&self, url: &str, range: ByteRange) -> Result<Bytes> {
        self.with_retry(url, |_| async move {
            let resp = self.transport.get(url, &[range]).await?;
            let body = match resp.status {
                206 => read_body(resp.body).await?,
                // Range ignored; cut the range out of the full body.
                200 => {
                    let full = read_body(resp.body).await?;
                    cut_range(&full, &range).ok_or_else(|| {
                        AttemptError::transient(format!(
                            "range {range} beyond end of a {} byte file",
                            full.len()
                        ))
                    })?
                }
                s => return Err(AttemptError::status(s)),
            };
            check_range_body(&range, &body)?;
            Ok(body)
        })
        .await
    }

    /// `None` when the server answered something other than a
    /// `multipart/byteranges` response covering every range.
    async fn get_multi(&self, url: &str, ranges: &[ByteRange]) -> Result<Option<Vec<Bytes>>> {
        self.with_retry(url, |_| async move {
            let resp = self.transport.get(url, ranges).await?;
            if !resp.is_success() {
                return Err(AttemptError::status(resp.status));
            }
            let Some(boundary) = multipart_boundary(&resp) else {
                return Ok(None);
            };
            let body = read_body(resp.body).await?;
            let parts = split_multipart(&body, &boundary).map_err(AttemptError::transient)?;

            let mut out = Vec::with_capacity(ranges.len());
            for r in ranges {
                let covering = parts.iter().find_map(|(have, data)| sub_range(have, data, r));
                let Some(data) = covering else {
                    return Ok(None);
                };
                check_range_body(r, &data)?;
                out.push(data);
            }
            Ok(Some(out))
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut n = 0u32;
        loop {
            n += 1;
            match attempt(n).await {
                Ok(v) => return Ok(v),
                Err(e) if e.retryable && n <= self.retry.max_retries => {
                    let delay = self.retry.backoff(n);
                    warn!(url, attempt = n, reason = %e.reason, ?delay, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::Fetch {
                        url: url.to_string(),
                        attempts: n,
                        reason: e.reason,
                    });
                }
            }
        }
    }
}

async fn write_parts(partial: &Path, parts: Vec<Bytes>) -> Result<FetchResult> {
    let mut file = File::create(partial).await?;
    let mut walker = MessageWalker::default();
    let mut written = 0u64;
    for part in parts {
        walker.restart();
        walker.feed(&part);
        file.write_all(&part).await?;
        written += part.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(FetchResult {
        bytes_written: written,
        messages_included: walker.total(),
    })
}

/// `<destination>.partial`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut s = destination.as_os_str().to_owned();
    s.push(".partial");
    PathBuf::from(s)
}

fn check_range_body(range: &ByteRange, body: &[u8]) -> std::result::Result<(), AttemptError> {
    match range.len() {
        Some(want) if body.len() as u64 != want => {
            return Err(AttemptError::transient(format!(
                "short body for range {range}: {} of {want} bytes",
                body.len()
            )));
        }
        None if body.is_empty() => {
            return Err(AttemptError::transient(format!("empty body for range {range}")));
        }
        _ => {}
    }
    if !body.starts_with(b"GRIB") {
        return Err(AttemptError::fatal(format!(
            "range {range} does not start with a GRIB message"
        )));
    }
    // a range cut inside a message means the index does not describe this file
    let mut walker = MessageWalker::default();
    walker.feed(body);
    if !walker.aligned() {
        return Err(AttemptError::fatal(format!("range {range} ends inside a GRIB message")));
    }
    Ok(())
}

fn cut_range(full: &Bytes, r: &ByteRange) -> Option<Bytes> {
    let len = full.len() as u64;
    if r.start >= len {
        return None;
    }
    let end = r.end.map_or(len - 1, |e| e.min(len - 1));
    Some(full.slice(r.start as usize..=end as usize))
}

/// The part of `have` (holding `data`) that covers `want`.
fn sub_range(have: &ByteRange, data: &Bytes, want: &ByteRange) -> Option<Bytes> {
    let have_end = have.end?;
    let want_end = want.end.unwrap_or(have_end);
    if want.start < have.start || want_end > have_end {
        return None;
    }
    let from = (want.start - have.start) as usize;
    let to = (want_end - have.start) as usize;
    (to < data.len()).then(|| data.slice(from..=to))
}

fn multipart_boundary(resp: &TransportResponse) -> Option<String> {
    let ct = resp.content_type.as_deref()?;
    let (mime, params) = ct.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/byteranges") {
        return None;
    }
    params.split(';').find_map(|p| {
        let (k, v) = p.split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

/// Split a `multipart/byteranges` body into `(range, data)` parts.
fn split_multipart(
    body: &Bytes,
    boundary: &str,
) -> std::result::Result<Vec<(ByteRange, Bytes)>, String> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut pos = 0;

    while let Some(found) = find(&body[pos..], delimiter.as_bytes()) {
        let cur = pos + found + delimiter.len();
        if body[cur..].starts_with(b"--") {
            return Ok(parts);
        }
        let header_end =
            find(&body[cur..], b"\r\n\r\n").ok_or("multipart part without header terminator")?;
        let headers = std::str::from_utf8(&body[cur..cur + header_end]).map_err(|e| e.to_string())?;
        let range = headers
            .lines()
            .find_map(|line| {
                let (k, v) = line.split_once(':')?;
                if k.trim().eq_ignore_ascii_case("content-range") {
                    parse_content_range(v)
                } else {
                    None
                }
            })
            .ok_or("multipart part without Content-Range")?;

        let data_start = cur + header_end + 4;
        let data_end = data_start + range.len().unwrap_or(0) as usize;
        if data_end > body.len() {
            return Err(format!("multipart part {range} truncated"));
        }
        parts.push((range, body.slice(data_start..data_end)));
        pos = data_end;
    }

    if parts.is_empty() {
        Err("no parts in multipart body".to_string())
    } else {
        Ok(parts)
    }
}

/// ` bytes 100-199/5000` -> `100-199`
fn parse_content_range(value: &str) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes")?.trim();
    let (range, _total) = spec.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    (end >= start).then(|| ByteRange::closed(start, end))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the message whose indicator section starts `header`
/// (GRIB1: 3 byte length at 4, GRIB2: 8 byte length at 8).
fn grib_message_length(header: &[u8]) -> Option<u64> {
    if header.len() < 16 || &header[0..4] != b"GRIB" {
        return None;
    }
    match header[7] {
        1 => Some(u64::from(header[4]) << 16 | u64::from(header[5]) << 8 | u64::from(header[6])),
        2 => {
            let mut len = [0u8; 8];
            len.copy_from_slice(&header[8..16]);
            Some(u64::from_be_bytes(len))
        }
        _ => None,
    }
}

/// Follows GRIB indicator sections through a stream of chunks, counting
/// messages.
#[derive(Debug, Default)]
struct MessageWalker {
    pos: u64,
    next: u64,
    header: Vec<u8>,
    count: usize,
    finished: usize,
    lost: bool,
    seen_any: bool,
}

impl MessageWalker {
    fn feed(&mut self, mut chunk: &[u8]) {
        while !self.lost && !chunk.is_empty() {
            let end = self.pos + chunk.len() as u64;
            if self.next >= end {
                self.pos = end;
                return;
            }
            if self.next > self.pos {
                chunk = &chunk[(self.next - self.pos) as usize..];
                self.pos = self.next;
            }

            let take = (16 - self.header.len()).min(chunk.len());
            self.header.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            self.pos += take as u64;
            if self.header.len() < 16 {
                return;
            }

            match grib_message_length(&self.header) {
                Some(len) if len >= 16 => {
                    self.seen_any = true;
                    self.count += 1;
                    self.next += len;
                    self.header.clear();
                }
                _ => self.lost = true,
            }
        }
    }

    /// Whole messages ended exactly where the data did.
    fn aligned(&self) -> bool {
        !self.lost && self.header.is_empty() && self.next == self.pos
    }

    fn saw_grib(&self) -> bool {
        self.seen_any
    }

    /// Start walking a new, independent buffer.
    fn restart(&mut self) {
        self.finished += self.count;
        let seen_any = self.seen_any;
        *self = Self {
            finished: self.finished,
            seen_any,
            ..Self::default()
        };
    }

    fn total(&self) -> usize {
        self.finished + self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockTransport, grib_file, grib_message};
    use tempfile::tempdir;

    const URL: &str = "https://a.test/model.grib2";

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    fn fetcher(mock: &Arc<MockTransport>) -> Fetcher {
        Fetcher::new(mock.clone(), fast_retry(), 4)
    }

    fn sample() -> Vec<u8> {
        grib_file(&[
            ("TMP", "2 m", 100),
            ("DPT", "2 m", 60),
            ("UGRD", "10 m", 80),
            ("VGRD", "10 m", 40),
        ])
        .0
    }

    #[test]
    fn backoff_is_capped() {
        let p = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        };
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(4), Duration::from_secs(5));
    }

    #[test]
    fn walker_counts_across_chunks() {
        let data = sample();
        let mut w = MessageWalker::default();
        for chunk in data.chunks(7) {
            w.feed(chunk);
        }
        assert_eq!(w.total(), 4);
        assert!(w.aligned());

        let mut cut = MessageWalker::default();
        cut.feed(&data[..150]);
        assert!(!cut.aligned());
    }

    #[tokio::test]
    async fn sequential_ranges_are_concatenated_in_order() {
        let data = sample();
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, data.clone());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        let ranges = [ByteRange::closed(0, 99), ByteRange::closed(160, 279)];
        let res = fetcher(&mock)
            .fetch(URL, &ranges, RangeStrategy::Sequential, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(res.bytes_written, 220);
        assert_eq!(res.messages_included, 3);
        let written = std::fs::read(&dest).unwrap();
        assert_eq!(&written[..100], &data[..100]);
        assert_eq!(&written[100..], &data[160..280]);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn multi_range_single_request() {
        let data = sample();
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, data.clone());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        let ranges = [ByteRange::closed(100, 159), ByteRange::open(240)];
        let res = fetcher(&mock)
            .fetch(URL, &ranges, RangeStrategy::MultiRange, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mock.count("GET", URL), 1);
        assert_eq!(res.messages_included, 2);
        let mut expected = data[100..160].to_vec();
        expected.extend_from_slice(&data[240..]);
        assert_eq!(std::fs::read(&dest).unwrap(), expected);
    }

    #[tokio::test]
    async fn provider_without_ranges_downloads_everything() {
        let data = sample();
        let mock = Arc::new(MockTransport::new());
        mock.serve_without_ranges(URL, data.clone());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        let res = fetcher(&mock)
            .fetch(URL, &[ByteRange::closed(0, 99)], RangeStrategy::None, &dest, &never())
            .await
            .unwrap();
        assert_eq!(res.bytes_written, data.len() as u64);
        assert_eq!(res.messages_included, 4);
        assert_eq!(mock.requests(), vec![format!("GET {URL}")]);
    }

    #[tokio::test]
    async fn range_ignored_by_server_is_cut_locally() {
        let data = sample();
        let mock = Arc::new(MockTransport::new());
        mock.serve_without_ranges(URL, data.clone());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        fetcher(&mock)
            .fetch(URL, &[ByteRange::closed(160, 239)], RangeStrategy::Sequential, &dest, &never())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), &data[160..240]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, sample()).fail_next(URL, 1).truncate_next(URL, 1);
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        let res = fetcher(&mock)
            .fetch(URL, &[ByteRange::closed(0, 99)], RangeStrategy::Sequential, &dest, &never())
            .await
            .unwrap();
        assert_eq!(res.bytes_written, 100);
        assert_eq!(mock.count("GET", URL), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_nothing_behind() {
        let mock = Arc::new(MockTransport::new());
        mock.status(URL, 503);
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        let err = fetcher(&mock)
            .fetch(URL, &[], RangeStrategy::Sequential, &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Fetch { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "HTTP 503");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.status(URL, 403);
        let dir = tempdir().unwrap();
        let dest = dir.path().join("x");

        let err = fetcher(&mock)
            .fetch(URL, &[ByteRange::closed(0, 9)], RangeStrategy::Sequential, &dest, &never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn non_grib_range_is_rejected() {
        let mut data = sample();
        data[100] = b'X';
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, data);
        let dir = tempdir().unwrap();
        let dest = dir.path().join("x");

        let err = fetcher(&mock)
            .fetch(URL, &[ByteRange::closed(100, 159)], RangeStrategy::Sequential, &dest, &never())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Fetch { attempts: 1, ref reason, .. } if reason.contains("GRIB")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn cancelled_fetch_removes_partial() {
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, grib_message(64, b'z'));
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(&mock)
            .fetch(URL, &[], RangeStrategy::Sequential, &dest, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn range_ending_inside_a_message_is_rejected() {
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, sample());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        let err = fetcher(&mock)
            .fetch(URL, &[ByteRange::closed(100, 129)], RangeStrategy::Sequential, &dest, &never())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::Fetch { attempts: 1, ref reason, .. } if reason.contains("ends inside")
            ),
            "{err:?}"
        );
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn multipart_part_ending_inside_a_message_is_rejected() {
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, sample());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");

        let ranges = [ByteRange::closed(0, 99), ByteRange::closed(160, 200)];
        let err = fetcher(&mock)
            .fetch(URL, &ranges, RangeStrategy::MultiRange, &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { ref reason, .. } if reason.contains("ends inside")));
        assert_eq!(mock.count("GET", URL), 1);
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn cancel_during_download_removes_partial() {
        let mock = Arc::new(MockTransport::new());
        mock.serve(URL, sample()).throttle(URL, Duration::from_secs(5));
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.grib2");
        let cancel = CancellationToken::new();

        let watcher = {
            let (cancel, partial) = (cancel.clone(), partial_path(&dest));
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let started = partial.exists();
                cancel.cancel();
                started
            })
        };

        let err = fetcher(&mock)
            .fetch(URL, &[], RangeStrategy::Sequential, &dest, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(watcher.await.unwrap(), "download had not started writing");
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn multipart_parsing() {
        let body = Bytes::from_static(
            b"\r\n--b1\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes 0-3/100\r\n\r\nGRIB\r\n--b1\r\nContent-Range: bytes 10-13/100\r\n\r\nGRIC\r\n--b1--\r\n",
        );
        let parts = split_multipart(&body, "b1").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, ByteRange::closed(0, 3));
        assert_eq!(&parts[1].1[..], b"GRIC");
        assert!(split_multipart(&Bytes::from_static(b"nothing"), "b1").is_err());
    }

    #[test]
    fn partial_suffix() {
        assert_eq!(partial_path(Path::new("/c/f.grib2")), PathBuf::from("/c/f.grib2.partial"));
    }
}
