//! Rune-at-a-time forwarding of remote output.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::error::ApiError;

const READ_CHUNK: usize = 4096;

/// Split `buf` at the last complete UTF-8 boundary. Invalid sequences are
/// dropped; an incomplete tail is left in `buf` for the next read.
pub fn take_runes(buf: &mut Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        let width = match buf[i] {
            0x00..=0x7f => 1,
            0xc2..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf4 => 4,
            _ => {
                i += 1;
                continue;
            }
        };
        if i + width > buf.len() {
            if std::str::from_utf8(&buf[i..]).is_err_and(|e| e.error_len().is_none()) {
                break;
            }
            i += 1;
            continue;
        }
        match std::str::from_utf8(&buf[i..i + width]) {
            Ok(s) => {
                out.extend_from_slice(s.as_bytes());
                i += width;
            }
            Err(_) => i += 1,
        }
    }
    buf.drain(..i);
    out
}

/// Read `reader` until EOF, pushing whole UTF-8 runes onto `out`.
/// Empty reads produce no frame.
pub async fn pump_runes<R: AsyncRead + Unpin>(
    mut reader: R,
    out: mpsc::Sender<Vec<u8>>,
) -> Result<(), ApiError> {
    let mut pending = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return Ok(()),
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);
        let runes = take_runes(&mut pending);
        if runes.is_empty() {
            continue;
        }
        if out.send(runes).await.is_err() {
            return Ok(());
        }
    }
}
