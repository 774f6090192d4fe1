use anyhow::{Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{self, Cursor, IsTerminal, Read};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

type InputChunk = io::Result<Cursor<Vec<u8>>>;

const INPUT_CHUNK_SIZE: usize = 1024;

/// Where an interactive session reads from and writes to. The core never
/// looks behind these handles.
pub struct BoxStreams {
    pub stdin: BoxReader,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
    pub is_tty: bool,
}

impl BoxStreams {
    pub fn standard() -> Self {
        Self {
            stdin: local_stdin(),
            stdout: Box::new(tokio::io::stdout()),
            stderr: Box::new(tokio::io::stderr()),
            is_tty: std::io::stdin().is_terminal() && std::io::stdout().is_terminal(),
        }
    }

    /// Columns and rows of the local terminal, when there is one.
    pub fn terminal_size(&self) -> Option<(u16, u16)> {
        if !self.is_tty {
            return None;
        }
        crossterm::terminal::size().ok()
    }
}

impl std::fmt::Debug for BoxStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStreams")
            .field("is_tty", &self.is_tty)
            .finish_non_exhaustive()
    }
}

/// Reads the process stdin on a plain thread and hands chunks to the
/// session over a channel. The pending blocking read must never hold the
/// runtime open once the session is over; the thread exits on its next
/// read after the receiver is gone.
fn local_stdin() -> BoxReader {
    let (tx, rx) = mpsc::channel::<InputChunk>(16);
    let spawned = std::thread::Builder::new()
        .name("hck-stdin".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buffer = [0u8; INPUT_CHUNK_SIZE];
            loop {
                let chunk = match stdin.read(&mut buffer) {
                    Ok(0) => return,
                    Ok(read) => Ok(Cursor::new(buffer[..read].to_vec())),
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => Err(error),
                };
                let failed = chunk.is_err();
                if tx.blocking_send(chunk).is_err() || failed {
                    return;
                }
            }
        });

    match spawned {
        Ok(_) => channel_reader(rx),
        Err(error) => {
            warn!("failed to start stdin reader: {error}");
            Box::new(tokio::io::empty())
        }
    }
}

fn channel_reader(rx: mpsc::Receiver<InputChunk>) -> BoxReader {
    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Box::new(StreamReader::new(Box::pin(chunks)))
}

/// Keeps the local terminal in raw mode until dropped.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    pub fn enable(is_tty: bool) -> Result<Self> {
        if is_tty {
            enable_raw_mode().context("failed to enable raw mode")?;
        }
        Ok(Self { enabled: is_tty })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled
            && let Err(error) = disable_raw_mode()
        {
            warn!("failed to disable raw mode: {error}");
        }
    }
}

/// Pipes local input into `remote_in` and remote output back to the local
/// streams. The session ends when remote output closes, when either copy
/// fails, or when `interrupt` fires. The close token is cancelled exactly
/// once from whichever side gets there first.
pub async fn pipe_session<R, W>(
    streams: BoxStreams,
    mut remote_out: R,
    mut remote_in: W,
    remote_err: Option<BoxReader>,
    interrupt: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let BoxStreams {
        mut stdin,
        mut stdout,
        mut stderr,
        is_tty,
    } = streams;
    let _raw_mode = RawModeGuard::enable(is_tty)?;
    let closed = CancellationToken::new();

    let input_closed = closed.clone();
    let input = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut stdin, &mut remote_in).await;
        let _ = remote_in.shutdown().await;
        if copied.is_err() {
            input_closed.cancel();
        }
        copied
    });

    let output_closed = closed.clone();
    let output = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut remote_out, &mut stdout).await;
        let _ = stdout.flush().await;
        output_closed.cancel();
        copied
    });

    let errors = remote_err.map(|mut remote_err| {
        tokio::spawn(async move {
            let copied = tokio::io::copy(&mut remote_err, &mut stderr).await;
            let _ = stderr.flush().await;
            copied
        })
    });

    tokio::select! {
        _ = closed.cancelled() => {}
        _ = interrupt.cancelled() => closed.cancel(),
    }

    input.abort();
    output.abort();
    if let Some(errors) = errors {
        errors.abort();
    }
    // releases the local input handle before returning
    let _ = input.await;

    // a task that already completed still yields its result after abort
    match output.await {
        Ok(Err(error)) => Err(error).context("session output stream failed"),
        _ => Ok(()),
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!("failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Installs the process-wide signal listener and returns the token it
/// cancels.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}
