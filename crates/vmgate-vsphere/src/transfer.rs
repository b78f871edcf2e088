//! Chunked streaming of disk devices to and from lease device URLs.
//!
//! Payloads move through a fixed 64 KiB buffer in both directions — the
//! whole disk image is never materialised in memory. Progress callbacks
//! fire after each buffer with the cumulative byte count; the caller maps
//! that onto the lease's reported percentage.
//!
//! A network fault mid-stream surfaces as `PartialTransfer`; there is no
//! retry or resume — the caller restarts the whole device transfer.

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::session::SESSION_HEADER;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use log::debug;
use reqwest::{Body, Client};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use url::Url;

/// Fixed transfer buffer size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Device URLs are platform-issued; reject anything that does not parse
/// before a single byte moves.
fn checked_url(device_url: &str) -> VsphereResult<Url> {
    Url::parse(device_url)
        .map_err(|e| VsphereError::parse(format!("Malformed device URL '{device_url}': {e}")))
}

/// Map cumulative bytes onto the overall lease percentage.
///
/// `bytes_done` counts devices already finished, `bytes_this_device` the
/// running count within the current device. Clamped to [0, 100].
pub fn device_percent(bytes_done: u64, bytes_this_device: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }
    let moved = bytes_done.saturating_add(bytes_this_device) as u128;
    (moved * 100 / total_bytes as u128).min(100) as u8
}

/// Turn a file into a stream of 64 KiB chunks, invoking `on_chunk` with
/// the cumulative byte count after each buffer read.
fn file_chunk_stream<F>(
    file: tokio::fs::File,
    on_chunk: F,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send
where
    F: FnMut(u64) + Send + 'static,
{
    futures::stream::unfold(Some((file, 0u64, on_chunk)), |state| async move {
        let (mut file, sent, mut on_chunk) = state?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                let sent = sent + n as u64;
                on_chunk(sent);
                Some((Ok(Bytes::from(buf)), Some((file, sent, on_chunk))))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Stream a local blob to a device URL via a chunked POST.
///
/// Returns the number of bytes moved (the file size on success).
pub async fn upload<F>(
    http: &Client,
    token: &str,
    device_url: &str,
    source: &Path,
    on_progress: F,
) -> VsphereResult<u64>
where
    F: FnMut(u64) + Send + 'static,
{
    let url = checked_url(device_url)?;
    let total = tokio::fs::metadata(source)
        .await
        .map_err(|e| {
            VsphereError::new(
                VsphereErrorKind::Other,
                format!("Cannot stat '{}': {e}", source.display()),
            )
        })?
        .len();

    let file = tokio::fs::File::open(source).await.map_err(|e| {
        VsphereError::new(
            VsphereErrorKind::Other,
            format!("Cannot open '{}': {e}", source.display()),
        )
    })?;

    debug!("Uploading {} ({} bytes) to {}", source.display(), total, device_url);

    let body = Body::wrap_stream(file_chunk_stream(file, on_progress));
    let resp = http
        .post(url)
        .header(SESSION_HEADER, token)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                VsphereError::timeout(format!("Device upload timed out: {e}"))
            } else if e.is_connect() {
                VsphereError::connection(format!("Device URL unreachable: {e}"))
            } else {
                VsphereError::partial_transfer(format!("Device upload interrupted: {e}"))
            }
        })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(VsphereError::api(
            status.as_u16(),
            format!("Device upload rejected: {body}"),
        ));
    }

    Ok(total)
}

/// Stream a device URL into a local file via a buffered GET.
///
/// Returns the number of bytes written to `dest`.
pub async fn download<F>(
    http: &Client,
    token: &str,
    device_url: &str,
    dest: &Path,
    mut on_progress: F,
) -> VsphereResult<u64>
where
    F: FnMut(u64),
{
    let url = checked_url(device_url)?;
    let resp = http
        .get(url)
        .header(SESSION_HEADER, token)
        .send()
        .await
        .map_err(VsphereError::from)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(VsphereError::api(
            status.as_u16(),
            format!("Device download rejected: {body}"),
        ));
    }

    let stream = resp
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(stream);

    let mut out = tokio::fs::File::create(dest).await.map_err(|e| {
        VsphereError::new(
            VsphereErrorKind::Other,
            format!("Cannot create '{}': {e}", dest.display()),
        )
    })?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| {
            VsphereError::partial_transfer(format!(
                "Device download interrupted after {written} bytes: {e}"
            ))
        })?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await.map_err(|e| {
            VsphereError::new(
                VsphereErrorKind::Other,
                format!("Write to '{}' failed: {e}", dest.display()),
            )
        })?;
        written += n as u64;
        on_progress(written);
    }

    out.flush().await?;
    debug!("Downloaded {} bytes from {} to {}", written, device_url, dest.display());
    Ok(written)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    async fn drive_chunk_stream(payload_len: usize) -> (usize, Vec<u64>) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0x5A; payload_len]).unwrap();
        drop(f);

        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let stream = file_chunk_stream(file, move |cumulative| {
            sink.lock().unwrap().push(cumulative);
        });
        futures::pin_mut!(stream);

        let mut chunks = 0usize;
        let mut streamed = 0usize;
        while let Some(item) = stream.next().await {
            let bytes = item.unwrap();
            assert!(bytes.len() <= CHUNK_SIZE);
            streamed += bytes.len();
            chunks += 1;
        }
        assert_eq!(streamed, payload_len);

        let calls = seen.lock().unwrap().clone();
        (chunks, calls)
    }

    #[tokio::test]
    async fn ten_mib_payload_reports_160_chunks() {
        let total = 10 * 1024 * 1024;
        let (chunks, calls) = drive_chunk_stream(total).await;

        // 10,485,760 / 65,536 exact buffers
        assert_eq!(chunks, 160);
        assert_eq!(calls.len(), 160);

        // Cumulative counts strictly increase and end at the full payload.
        for pair in calls.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(*calls.last().unwrap(), total as u64);

        // Mapped percentages never decrease and finish at exactly 100.
        let mut last = 0u8;
        for c in &calls {
            let pct = device_percent(0, *c, total as u64);
            assert!(pct >= last);
            last = pct;
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn short_final_buffer_is_delivered() {
        let total = 100_000; // not a multiple of 64 KiB
        let (chunks, calls) = drive_chunk_stream(total).await;
        assert_eq!(chunks, 2);
        assert_eq!(calls, vec![65_536, 100_000]);
    }

    #[tokio::test]
    async fn empty_payload_yields_no_chunks() {
        let (chunks, calls) = drive_chunk_stream(0).await;
        assert_eq!(chunks, 0);
        assert!(calls.is_empty());
    }

    #[test]
    fn percent_mapping_clamps_and_scales() {
        assert_eq!(device_percent(0, 0, 200), 0);
        assert_eq!(device_percent(100, 50, 200), 75);
        assert_eq!(device_percent(200, 0, 200), 100);
        // Over-reporting never exceeds 100.
        assert_eq!(device_percent(200, 50, 200), 100);
        // Degenerate empty transfer is complete by definition.
        assert_eq!(device_percent(0, 0, 0), 100);
    }

    #[test]
    fn malformed_device_urls_are_rejected() {
        assert!(checked_url("https://esx1.lab.local/nfc/disk-0").is_ok());
        let err = checked_url("not a url").unwrap_err();
        assert_eq!(err.kind, crate::error::VsphereErrorKind::Parse);
    }

    #[test]
    fn percent_mapping_survives_huge_sizes() {
        let total = u64::MAX;
        assert_eq!(device_percent(total / 2, 0, total), 49);
        assert_eq!(device_percent(total, 0, total), 100);
    }
}
