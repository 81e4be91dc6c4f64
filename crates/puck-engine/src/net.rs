//! Socket plumbing for hub and peer connections.
//!
//! NMDC frames are `|`-terminated byte strings. Each connection gets a
//! reader task and a writer task; the engine actor owns all protocol
//! state and exchanges messages with them. Peer readers run in lockstep
//! with the engine: after every line they wait for a directive, because
//! the bytes following a transfer announcement are raw payload, not
//! lines.

use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite,
    AsyncWriteExt, BufReader,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upper bound on a single protocol line; a peer exceeding it is faulty
pub const MAX_LINE: usize = 256 * 1024;

/// Chunk size for streaming file payloads
const COPY_CHUNK: usize = 64 * 1024;

/// Read one `|`-terminated frame, without the terminator. `Ok(None)`
/// means clean EOF.
///
/// # Errors
///
/// I/O errors from the underlying stream, or `InvalidData` when a frame
/// exceeds [`MAX_LINE`].
pub async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'|', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "protocol line too long",
        ));
    }
    if line.last() == Some(&b'|') {
        line.pop();
    }
    Ok(Some(line))
}

/// What a peer reader should do after delivering a line
#[derive(Debug)]
pub enum ReadDirective {
    /// Keep reading lines
    Continue,
    /// The next `count` raw bytes are file content; append them at
    /// `offset` of `path`, then report completion
    ReceiveFile {
        /// Destination file
        path: PathBuf,
        /// Write position
        offset: u64,
        /// Exact byte count to consume
        count: u64,
    },
    /// Stop reading and drop the connection
    Close,
}

/// Events a peer reader reports to the engine
#[derive(Debug)]
pub enum ReadEvent {
    /// One protocol line arrived
    Line(Vec<u8>),
    /// A payload receive moved forward; informational, no directive is
    /// expected in response
    FileProgress {
        /// Bytes written so far in this payload
        written: u64,
    },
    /// A requested payload was fully received
    FileDone {
        /// Bytes actually written
        written: u64,
    },
    /// A requested payload failed midway
    FileFailed {
        /// What went wrong
        error: String,
    },
    /// The connection ended (EOF or error)
    Closed {
        /// The error, when it was not a clean EOF
        error: Option<String>,
    },
}

/// Drive a peer read half in lockstep with the engine.
///
/// For every [`ReadEvent`] sent, the engine answers with exactly one
/// [`ReadDirective`] (payload receives report completion through another
/// event and then also wait for a directive).
pub async fn peer_read_loop<R>(
    read: R,
    events: mpsc::UnboundedSender<ReadEvent>,
    mut directives: mpsc::Receiver<ReadDirective>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read);

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = events.send(ReadEvent::Closed { error: None });
                return;
            }
            Err(e) => {
                let _ = events.send(ReadEvent::Closed {
                    error: Some(e.to_string()),
                });
                return;
            }
        };

        if events.send(ReadEvent::Line(frame)).is_err() {
            return;
        }

        loop {
            match directives.recv().await {
                Some(ReadDirective::Continue) => break,
                Some(ReadDirective::Close) | None => return,
                Some(ReadDirective::ReceiveFile {
                    path,
                    offset,
                    count,
                }) => {
                    let outcome =
                        receive_file(&mut reader, &path, offset, count, &events).await;
                    let event = match outcome {
                        Ok(written) => ReadEvent::FileDone { written },
                        Err(e) => ReadEvent::FileFailed {
                            error: e.to_string(),
                        },
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                    // fall through: wait for the next directive
                }
            }
        }
    }
}

/// How often a payload receive reports progress
const PROGRESS_EVERY: u64 = 1024 * 1024;

/// Read exactly `count` bytes into `path` at `offset`
async fn receive_file<R: AsyncRead + Unpin>(
    reader: &mut R,
    path: &PathBuf,
    offset: u64,
    count: u64,
    events: &mpsc::UnboundedSender<ReadEvent>,
) -> std::io::Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut remaining = count;
    let mut last_report = 0u64;
    let mut chunk = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = chunk.len().min(usize::try_from(remaining).unwrap_or(chunk.len()));
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed mid-transfer",
            ));
        }
        file.write_all(&chunk[..n]).await?;
        remaining -= n as u64;

        let written = count - remaining;
        if written - last_report >= PROGRESS_EVERY && remaining > 0 {
            last_report = written;
            let _ = events.send(ReadEvent::FileProgress { written });
        }
    }

    file.flush().await?;
    Ok(count)
}

/// Work items for a connection's writer task
#[derive(Debug)]
pub enum WriteItem {
    /// One already-framed protocol line
    Line(Vec<u8>),
    /// Stream a file range
    FileRange {
        /// Source file
        path: PathBuf,
        /// First byte
        offset: u64,
        /// Byte count
        count: u64,
    },
    /// Stream an in-memory payload
    Bytes(Vec<u8>),
    /// Flush and stop
    Shutdown,
}

/// Events a writer task reports back
#[derive(Debug)]
pub enum WriteEvent {
    /// A `FileRange` or `Bytes` payload finished streaming
    PayloadDone {
        /// Bytes streamed
        sent: u64,
    },
    /// The socket failed
    Failed {
        /// What went wrong
        error: String,
    },
}

/// Drive a connection's write half. Items run strictly in order, so a
/// command line queued before a payload is on the wire first.
pub async fn write_loop<W>(
    mut write: W,
    mut items: mpsc::UnboundedReceiver<WriteItem>,
    events: mpsc::UnboundedSender<WriteEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = items.recv().await {
        let result = match item {
            WriteItem::Line(bytes) => {
                debug!(line = %String::from_utf8_lossy(&bytes), "-> peer");
                write.write_all(&bytes).await.map(|()| None)
            }
            WriteItem::Bytes(data) => {
                let len = data.len() as u64;
                write.write_all(&data).await.map(|()| Some(len))
            }
            WriteItem::FileRange {
                path,
                offset,
                count,
            } => send_file(&mut write, &path, offset, count).await,
            WriteItem::Shutdown => {
                let _ = write.flush().await;
                return;
            }
        };

        match result {
            Ok(Some(sent)) => {
                let _ = events.send(WriteEvent::PayloadDone { sent });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "write failed");
                let _ = events.send(WriteEvent::Failed {
                    error: e.to_string(),
                });
                return;
            }
        }
    }
}

/// Stream `count` bytes of `path` starting at `offset`
async fn send_file<W: AsyncWrite + Unpin>(
    write: &mut W,
    path: &PathBuf,
    offset: u64,
    count: u64,
) -> std::io::Result<Option<u64>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut remaining = count;
    let mut chunk = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = chunk.len().min(usize::try_from(remaining).unwrap_or(chunk.len()));
        let n = file.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "shared file shrank mid-upload",
            ));
        }
        write.write_all(&chunk[..n]).await?;
        remaining -= n as u64;
    }

    write.flush().await?;
    Ok(Some(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_splits_on_terminator() {
        let data: &[u8] = b"$MyNick nisse|$Lock ABC Pk=x|trailing";
        let mut reader = BufReader::new(data);

        assert_eq!(
            read_frame(&mut reader).await.unwrap().unwrap(),
            b"$MyNick nisse"
        );
        assert_eq!(
            read_frame(&mut reader).await.unwrap().unwrap(),
            b"$Lock ABC Pk=x"
        );
        // unterminated tail still surfaces at EOF
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"trailing");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lockstep_reader_receives_payload_after_line() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("incoming.bin");

        let mut wire = Vec::new();
        wire.extend_from_slice(b"$ADCSND file x 0 5|");
        wire.extend_from_slice(b"HELLO");
        wire.extend_from_slice(b"$Another|");

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (directive_tx, directive_rx) = mpsc::channel(4);
        let handle = tokio::spawn(peer_read_loop(
            std::io::Cursor::new(wire),
            event_tx,
            directive_rx,
        ));

        // line arrives, engine orders a payload receive
        let ReadEvent::Line(line) = event_rx.recv().await.unwrap() else {
            panic!("expected line");
        };
        assert_eq!(line, b"$ADCSND file x 0 5");
        directive_tx
            .send(ReadDirective::ReceiveFile {
                path: target.clone(),
                offset: 0,
                count: 5,
            })
            .await
            .unwrap();

        let ReadEvent::FileDone { written } = event_rx.recv().await.unwrap() else {
            panic!("expected payload completion");
        };
        assert_eq!(written, 5);
        directive_tx.send(ReadDirective::Continue).await.unwrap();

        // framing resumes cleanly after the payload
        let ReadEvent::Line(line) = event_rx.recv().await.unwrap() else {
            panic!("expected line");
        };
        assert_eq!(line, b"$Another");
        directive_tx.send(ReadDirective::Continue).await.unwrap();

        let ReadEvent::Closed { error } = event_rx.recv().await.unwrap() else {
            panic!("expected close");
        };
        assert!(error.is_none());
        handle.await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"HELLO");
    }

    #[tokio::test]
    async fn test_writer_orders_lines_before_payload() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("upload.bin");
        std::fs::write(&source, b"0123456789").unwrap();

        let (item_tx, item_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let mut sink = std::io::Cursor::new(Vec::new());
        item_tx
            .send(WriteItem::Line(b"$ADCSND file x 2 5|".to_vec()))
            .unwrap();
        item_tx
            .send(WriteItem::FileRange {
                path: source,
                offset: 2,
                count: 5,
            })
            .unwrap();
        item_tx.send(WriteItem::Shutdown).unwrap();

        write_loop(&mut sink, item_rx, event_tx).await;

        assert_eq!(sink.into_inner(), b"$ADCSND file x 2 5|23456");
        let WriteEvent::PayloadDone { sent } = event_rx.recv().await.unwrap() else {
            panic!("expected payload completion");
        };
        assert_eq!(sent, 5);
    }

    #[tokio::test]
    async fn test_short_upload_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("short.bin");
        std::fs::write(&source, b"abc").unwrap();

        let (item_tx, item_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        item_tx
            .send(WriteItem::FileRange {
                path: source,
                offset: 0,
                count: 10,
            })
            .unwrap();
        drop(item_tx);

        let mut sink = std::io::Cursor::new(Vec::new());
        write_loop(&mut sink, item_rx, event_tx).await;
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            WriteEvent::Failed { .. }
        ));
    }
}
