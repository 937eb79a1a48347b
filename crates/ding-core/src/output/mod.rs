//! Output pipe: per step, line-buffers a build child's stdout/stderr
//! concurrently, writes the three on-disk artifacts, and publishes each
//! line to the event bus. Also parses `release:` artifact declarations
//! out of the captured `build` step's stdout.

use std::path::Path;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::{DingError, Result};
use crate::event::{Event, EventBus, OutputStream};
use crate::models::{BuildId, StepName};

/// Internal line buffer: flushes on `\n` or when it reaches 1 KiB,
/// whichever comes first. A line flushed by the size limit rather than a
/// newline is still delivered as one `output` event — partial lines are
/// observable by subscribers exactly as they were written to disk.
const FLUSH_THRESHOLD: usize = 1024;

struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(FLUSH_THRESHOLD) }
    }

    /// Feeds one read chunk, returning complete lines (including any
    /// size-forced flush) ready to be written out.
    fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in chunk {
            self.buf.push(byte);
            if byte == b'\n' || self.buf.len() >= FLUSH_THRESHOLD {
                lines.push(std::mem::take(&mut self.buf));
            }
        }
        lines
    }

    fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Runs one stream (stdout or stderr) of a step: reads it to completion,
/// writing each line to its per-stream file, the combined file, and the
/// event bus.
async fn pump_stream(
    mut reader: impl AsyncRead + Unpin,
    build_id: BuildId,
    step: StepName,
    stream: OutputStream,
    mut stream_file: tokio::fs::File,
    combined_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    bus: EventBus,
) -> Result<()> {
    let mut linebuf = LineBuffer::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.map_err(DingError::Io)?;
        if n == 0 {
            break;
        }
        for line in linebuf.feed(&chunk[..n]) {
            stream_file.write_all(&line).await.map_err(DingError::Io)?;
            let _ = combined_tx.send(line.clone()).await;
            bus.publish(Event::Output {
                build_id: build_id.0,
                step: step.as_str().to_string(),
                stream,
                text: String::from_utf8_lossy(&line).to_string(),
            })
            .await;
        }
    }
    if let Some(rest) = linebuf.take_remainder() {
        stream_file.write_all(&rest).await.map_err(DingError::Io)?;
        let _ = combined_tx.send(rest.clone()).await;
        bus.publish(Event::Output {
            build_id: build_id.0,
            step: step.as_str().to_string(),
            stream,
            text: String::from_utf8_lossy(&rest).to_string(),
        })
        .await;
    }
    stream_file.flush().await.map_err(DingError::Io)?;
    Ok(())
}

/// Result of running one step through the output pipe.
pub struct StepOutcome {
    /// Empty string on success, an error description on failure, exactly
    /// as delivered on the status channel.
    pub status: String,
    pub elapsed_nsec: u64,
}

/// Drives one step's capture: opens the three on-disk files, publishes a
/// step-start event, pumps stdout/stderr concurrently, waits for the
/// status channel, and records elapsed time.
pub async fn run_step(
    output_dir: &Path,
    build_id: BuildId,
    step: StepName,
    stdout: impl AsyncRead + Unpin + Send + 'static,
    stderr: impl AsyncRead + Unpin + Send + 'static,
    status: oneshot::Receiver<String>,
    bus: EventBus,
) -> Result<StepOutcome> {
    tokio::fs::create_dir_all(output_dir).await.map_err(DingError::Io)?;

    let stdout_file = open_append(output_dir, step, "stdout").await?;
    let stderr_file = open_append(output_dir, step, "stderr").await?;
    let mut combined_file = open_append(output_dir, step, "output").await?;

    bus.publish(Event::Output {
        build_id: build_id.0,
        step: step.as_str().to_string(),
        stream: OutputStream::Stdout,
        text: String::new(),
    })
    .await;

    let (combined_tx, mut combined_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(256);
    let combined_task = tokio::spawn(async move {
        while let Some(line) = combined_rx.recv().await {
            if combined_file.write_all(&line).await.is_err() {
                break;
            }
        }
        let _ = combined_file.flush().await;
    });

    let start = Instant::now();

    let stdout_task = tokio::spawn(pump_stream(
        stdout,
        build_id,
        step,
        OutputStream::Stdout,
        stdout_file,
        combined_tx.clone(),
        bus.clone(),
    ));
    let stderr_task = tokio::spawn(pump_stream(
        stderr,
        build_id,
        step,
        OutputStream::Stderr,
        stderr_file,
        combined_tx.clone(),
        bus.clone(),
    ));
    drop(combined_tx);

    let (stdout_res, stderr_res) = tokio::join!(stdout_task, stderr_task);
    stdout_res.map_err(|e| DingError::ChildProcess(e.to_string()))??;
    stderr_res.map_err(|e| DingError::ChildProcess(e.to_string()))??;
    let _ = combined_task.await;

    let status = status.await.unwrap_or_else(|_| {
        "status channel closed before the child reported completion".to_string()
    });

    let elapsed_nsec = start.elapsed().as_nanos() as u64;
    tokio::fs::write(
        output_dir.join(format!("{}.nsec", step.as_str())),
        elapsed_nsec.to_string(),
    )
    .await
    .map_err(DingError::Io)?;

    Ok(StepOutcome { status, elapsed_nsec })
}

async fn open_append(dir: &Path, step: StepName, ext: &str) -> Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.{ext}", step.as_str())))
        .await
        .map_err(DingError::Io)
}

/// A validated artifact declaration parsed from a `release:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDeclaration {
    pub command: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub toolchain: String,
    pub filename: String,
}

/// Scans `build.stdout` for `release:`-prefixed lines. A line is ignored
/// unless its first whitespace token is literally `release:`; such a
/// line must then have exactly seven whitespace-delimited tokens or the
/// whole scan fails as a user error.
pub fn parse_artifact_declarations(stdout: &str) -> Result<Vec<ArtifactDeclaration>> {
    let mut declarations = Vec::new();
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"release:") {
            continue;
        }
        if tokens.len() != 7 {
            return Err(DingError::InvalidResultLine(line.to_string()));
        }
        declarations.push(ArtifactDeclaration {
            command: tokens[1].to_string(),
            version: tokens[2].to_string(),
            os: tokens[3].to_string(),
            arch: tokens[4].to_string(),
            toolchain: tokens[5].to_string(),
            filename: tokens[6].to_string(),
        });
    }
    Ok(declarations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_unrelated_lines() {
        let out = "building...\nrelease: demo 1.0 linux amd64 gcc-13 out/demo\ndone\n";
        let decls = parse_artifact_declarations(out).unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].filename, "out/demo");
    }

    #[test]
    fn wrong_arity_is_a_user_error() {
        let out = "release: demo 1.0 linux amd64 gcc-13\n";
        let err = parse_artifact_declarations(out).unwrap_err();
        assert!(matches!(err, DingError::InvalidResultLine(_)));
    }

    #[test]
    fn multiple_declarations_in_order() {
        let out = "release: a 1 linux amd64 gcc out/a\nrelease: b 2 linux amd64 gcc out/b\n";
        let decls = parse_artifact_declarations(out).unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].command, "a");
        assert_eq!(decls[1].command, "b");
    }

    #[test]
    fn line_buffer_flushes_on_fill_without_newline() {
        let mut buf = LineBuffer::new();
        let chunk = vec![b'x'; FLUSH_THRESHOLD + 5];
        let lines = buf.feed(&chunk);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), FLUSH_THRESHOLD);
        assert_eq!(buf.take_remainder().unwrap().len(), 5);
    }

    #[test]
    fn line_buffer_flushes_on_newline() {
        let mut buf = LineBuffer::new();
        let lines = buf.feed(b"hello\nworld");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], b"hello\n");
        assert_eq!(buf.take_remainder().unwrap(), b"world");
    }
}
