//! Stratum connection handler for the Tokio runtime.
//!
//! Reads one line at a time, dispatches it to the session's state machine
//! and writes the response before reading the next line, so responses leave
//! in request order and never interleave.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::parser::{self, DecodeError, MAX_LINE_LENGTH};
use super::state::{CheckedShare, StateMachine, Step};
use crate::error::ProxyResult;

/// Outcome of reading one frame.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line,
    TooLong,
    Eof,
}

/// Handle a Stratum connection until the peer disconnects, a transport error
/// occurs or `close` is cancelled.
pub async fn handle_connection(
    stream: TcpStream,
    mut machine: StateMachine,
    close: CancellationToken,
    shutdown_grace: Duration,
) -> ProxyResult<()> {
    let peer = machine.session().peer;
    info!(peer = %peer, session = machine.session().id, "Client connected");

    let result = serve(stream, &mut machine, &close, shutdown_grace).await;

    let session = machine.session();
    let connected_for = chrono::Utc::now() - session.connected_at;
    info!(
        peer = %peer,
        worker = session.worker.as_deref().unwrap_or("-"),
        accepted = session.accepted,
        rejected = session.rejected,
        connected_secs = connected_for.num_seconds(),
        "Client disconnected"
    );

    result
}

async fn serve(
    stream: TcpStream,
    machine: &mut StateMachine,
    close: &CancellationToken,
    shutdown_grace: Duration,
) -> ProxyResult<()> {
    let peer = machine.session().peer;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut line = Vec::with_capacity(1024);
    let mut out = BytesMut::with_capacity(1024);

    loop {
        line.clear();

        let frame = tokio::select! {
            biased;
            _ = close.cancelled() => {
                debug!(peer = %peer, "Session closed by proxy");
                return Ok(());
            }
            frame = read_frame(&mut reader, &mut line) => frame?,
        };

        let decoded = match frame {
            Frame::Eof => {
                trace!(peer = %peer, "Connection closed by client");
                return Ok(());
            }
            Frame::TooLong => Err(DecodeError::TooLong),
            Frame::Line => parser::decode(&line),
        };

        let request = match decoded {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Skipping undecodable line");
                continue;
            }
        };
        debug!(peer = %peer, rx = %String::from_utf8_lossy(&line).trim_end(), "Received");

        let response = match machine.handle(request) {
            Step::Reply(response) => response,
            Step::Verify(check) => {
                let task = tokio::task::spawn_blocking(move || check.run());
                match await_share(task, close, shutdown_grace).await? {
                    Some(checked) => machine.finish(checked),
                    None => {
                        warn!(
                            peer = %peer,
                            grace_ms = shutdown_grace.as_millis() as u64,
                            "Abandoning share check after shutdown grace period"
                        );
                        return Ok(());
                    }
                }
            }
        };

        out.clear();
        parser::encode(&response, &mut out)?;
        debug!(peer = %peer, tx = %String::from_utf8_lossy(&out).trim_end(), "Sending");

        writer.write_all(&out).await?;
        writer.flush().await?;
    }
}

/// Read up to and including the next newline, at most `MAX_LINE_LENGTH`
/// bytes. Longer lines are drained up to their newline and reported as
/// `TooLong`. A final line without a newline still counts as a line.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', buf)
        .await?;

    if n == 0 {
        return Ok(Frame::Eof);
    }
    if buf.ends_with(b"\n") || n < MAX_LINE_LENGTH {
        return Ok(Frame::Line);
    }

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(Frame::TooLong);
        }
        let newline = available.iter().position(|&b| b == b'\n');
        match newline {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(Frame::TooLong);
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

/// Wait for a share check. Once `close` is cancelled the check gets
/// `grace` more time; `None` means it was abandoned.
async fn await_share(
    mut task: JoinHandle<CheckedShare>,
    close: &CancellationToken,
    grace: Duration,
) -> ProxyResult<Option<CheckedShare>> {
    tokio::select! {
        checked = &mut task => return Ok(Some(checked?)),
        _ = close.cancelled() => {}
    }

    match tokio::time::timeout(grace, &mut task).await {
        Ok(checked) => Ok(Some(checked?)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frames(input: &[u8]) -> Vec<(Frame, Vec<u8>)> {
        let mut reader = BufReader::with_capacity(16, input);
        let mut out = Vec::new();
        loop {
            let mut buf = Vec::new();
            let frame = read_frame(&mut reader, &mut buf).await.unwrap();
            if frame == Frame::Eof {
                return out;
            }
            out.push((frame, buf));
        }
    }

    #[tokio::test]
    async fn test_read_frame_lines() {
        let got = frames(b"{\"a\":1}\n\n{\"b\":2}").await;
        assert_eq!(
            got,
            vec![
                (Frame::Line, b"{\"a\":1}\n".to_vec()),
                (Frame::Line, b"\n".to_vec()),
                (Frame::Line, b"{\"b\":2}".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_frame_too_long_is_skipped() {
        let mut input = vec![b'x'; MAX_LINE_LENGTH + 100];
        input.extend_from_slice(b"\n{\"ok\":true}\n");
        let got = frames(&input).await;

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, Frame::TooLong);
        assert_eq!(got[1], (Frame::Line, b"{\"ok\":true}\n".to_vec()));
    }

    #[tokio::test]
    async fn test_read_frame_exact_limit() {
        let mut input = vec![b'x'; MAX_LINE_LENGTH - 1];
        input.push(b'\n');
        let got = frames(&input).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Frame::Line);
    }

    #[tokio::test]
    async fn test_share_abandoned_after_grace() {
        let close = CancellationToken::new();
        close.cancel();
        let task: JoinHandle<CheckedShare> = tokio::spawn(std::future::pending());
        let result = await_share(task, &close, Duration::from_millis(20)).await;
        assert!(matches!(result, Ok(None)));
    }
}
