use crate::event::Emitter;
use crate::model::{AttachMode, BoxPort};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const LOCAL_BIND_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Returns the first port at or above `requested` that can be bound locally.
pub fn find_open_port(requested: u16) -> Result<u16> {
    for port in requested..=u16::MAX {
        if port == 0 {
            continue;
        }
        if StdTcpListener::bind((LOCAL_BIND_ADDRESS, port)).is_ok() {
            return Ok(port);
        }
    }
    anyhow::bail!("no open port found at or above {requested}")
}

/// Rewrites every `local` field with the port that is actually free, calling
/// `on_resolved` once per port so the caller can report or bind it.
pub fn resolve_ports<F>(ports: &[BoxPort], mut on_resolved: F) -> Result<Vec<BoxPort>>
where
    F: FnMut(&BoxPort),
{
    let mut resolved = Vec::with_capacity(ports.len());
    for port in ports {
        let local = find_open_port(port.local)
            .with_context(|| format!("failed to resolve local port for {}", port.alias))?;
        let port = BoxPort {
            local,
            ..port.clone()
        };
        on_resolved(&port);
        resolved.push(port);
    }
    Ok(resolved)
}

async fn bind_open_port(requested: u16) -> Result<(TcpListener, u16)> {
    let mut port = requested.max(1);
    loop {
        match TcpListener::bind((LOCAL_BIND_ADDRESS, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr().context("failed to read bound address")?;
                return Ok((listener, bound.port()));
            }
            Err(_) if port < u16::MAX => port += 1,
            Err(error) => {
                return Err(error).with_context(|| format!("no open port found at or above {requested}"));
            }
        }
    }
}

pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Opens the remote end of a tunnel for every accepted local connection.
#[async_trait]
pub trait TunnelDialer: Send + Sync + 'static {
    async fn dial(&self, port: &BoxPort) -> Result<TunnelStream>;
}

/// One listener task per port. A failing port ends only its own task.
pub struct TunnelSet {
    ports: Vec<BoxPort>,
    tasks: JoinSet<(String, Result<()>)>,
    cancel: CancellationToken,
}

impl TunnelSet {
    pub async fn open<D>(ports: &[BoxPort], dialer: Arc<D>, emitter: &Emitter) -> Result<Self>
    where
        D: TunnelDialer,
    {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut bound = Vec::with_capacity(ports.len());

        for port in ports {
            let (listener, local) = bind_open_port(port.local).await?;
            let port = BoxPort {
                local,
                ..port.clone()
            };
            emitter.console(format!(
                "[{}] tunnel http://localhost:{} -> {}",
                port.alias, port.local, port.remote
            ));

            let task_port = port.clone();
            let task_dialer = dialer.clone();
            let task_emitter = emitter.clone();
            let task_cancel = cancel.clone();
            tasks.spawn(async move {
                let alias = task_port.alias.clone();
                let result =
                    serve_port(listener, task_port, task_dialer, task_emitter, task_cancel).await;
                (alias, result)
            });
            bound.push(port);
        }

        Ok(Self {
            ports: bound,
            tasks,
            cancel,
        })
    }

    pub fn ports(&self) -> &[BoxPort] {
        &self.ports
    }

    /// Resolves with the first port failure, or `None` once every listener
    /// has stopped cleanly.
    pub async fn next_error(&mut self) -> Option<anyhow::Error> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((alias, Err(error))) => {
                    return Some(error.context(format!("tunnel {alias} failed")));
                }
                Err(error) if error.is_cancelled() => {}
                Err(error) => return Some(anyhow::Error::new(error).context("tunnel task panicked")),
            }
        }
        None
    }

    pub async fn close(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Keeps tunnels open until one of them fails or the process is interrupted.
pub async fn hold_tunnels(tunnels: &mut TunnelSet, interrupt: &CancellationToken) -> Result<()> {
    tokio::select! {
        failed = tunnels.next_error() => match failed {
            Some(error) => Err(error),
            None => Ok(()),
        },
        _ = interrupt.cancelled() => Ok(()),
    }
}

/// Opens tunnels for `ports` when `mode` asks for them, then runs `shell` or
/// holds the tunnels until interrupted. Tunnels close when the shell ends.
pub async fn attach_with_tunnels<D, S>(
    mode: AttachMode,
    ports: &[BoxPort],
    dialer: Arc<D>,
    emitter: &Emitter,
    interrupt: &CancellationToken,
    shell: S,
) -> Result<()>
where
    D: TunnelDialer,
    S: Future<Output = Result<()>>,
{
    let mut tunnels = if mode.wants_tunnel() && !ports.is_empty() {
        let tunnels = TunnelSet::open(ports, dialer, emitter).await?;
        emitter.debug(format!("{} tunnels open", tunnels.ports().len()));
        Some(tunnels)
    } else {
        if mode.wants_tunnel() {
            emitter.info("no ports declared, tunnel ignored");
        }
        None
    };

    let result = match (&mut tunnels, mode.wants_shell()) {
        (_, true) => shell.await,
        (Some(tunnels), false) => {
            emitter.loader_stop();
            hold_tunnels(tunnels, interrupt).await
        }
        (None, false) => Ok(()),
    };

    if let Some(tunnels) = tunnels {
        tunnels.close().await;
    }
    result
}

async fn serve_port<D>(
    listener: TcpListener,
    port: BoxPort,
    dialer: Arc<D>,
    emitter: Emitter,
    cancel: CancellationToken,
) -> Result<()>
where
    D: TunnelDialer,
{
    loop {
        let (mut socket, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted
                .with_context(|| format!("failed to accept connection on port {}", port.local))?,
        };
        emitter.debug(format!("[{}] connection from {peer}", port.alias));

        let mut remote = match dialer.dial(&port).await {
            Ok(remote) => remote,
            Err(error) => {
                emitter.error(format!("[{}] tunnel error: {error:#}", port.alias));
                return Err(error);
            }
        };

        let alias = port.alias.clone();
        let connection_emitter = emitter.clone();
        let connection_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection_cancel.cancelled() => {}
                copied = tokio::io::copy_bidirectional(&mut socket, &mut remote) => match copied {
                    Ok((sent, received)) => connection_emitter.debug(format!(
                        "[{alias}] connection closed, sent={sent} received={received}"
                    )),
                    Err(error) => connection_emitter.warning(format!(
                        "[{alias}] connection error: {error}"
                    )),
                },
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{
        TunnelDialer, TunnelSet, TunnelStream, attach_with_tunnels, find_open_port, resolve_ports,
    };
    use crate::event::{Emitter, EventBus, EventKind};
    use crate::model::{AttachMode, BoxPort};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn port(alias: &str, local: u16, remote: u16) -> BoxPort {
        BoxPort {
            alias: alias.to_string(),
            local,
            remote,
            public: false,
        }
    }

    #[test]
    fn busy_port_resolves_to_a_higher_free_one() {
        let busy = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let requested = busy.local_addr().unwrap().port();

        let actual = find_open_port(requested).unwrap();
        assert_ne!(actual, requested);
        assert!(actual > requested);
        assert!(StdTcpListener::bind(("127.0.0.1", actual)).is_ok());
    }

    #[test]
    fn resolved_ports_report_actual_value() {
        let busy = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let requested = busy.local_addr().unwrap().port();

        let mut seen = Vec::new();
        let resolved =
            resolve_ports(&[port("tty", requested, 7681)], |port| seen.push(port.local)).unwrap();
        assert_eq!(resolved[0].remote, 7681);
        assert_ne!(resolved[0].local, requested);
        assert_eq!(seen, vec![resolved[0].local]);
    }

    struct EchoDialer;

    #[async_trait]
    impl TunnelDialer for EchoDialer {
        async fn dial(&self, _port: &BoxPort) -> Result<TunnelStream> {
            let (local, mut remote) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buffer = [0u8; 64];
                while let Ok(read) = remote.read(&mut buffer).await {
                    if read == 0 || remote.write_all(&buffer[..read]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(local))
        }
    }

    struct FailingDialer;

    #[async_trait]
    impl TunnelDialer for FailingDialer {
        async fn dial(&self, port: &BoxPort) -> Result<TunnelStream> {
            anyhow::bail!("remote port {} refused", port.remote)
        }
    }

    #[tokio::test]
    async fn tunnel_forwards_bytes() {
        let bus = Arc::new(EventBus::new());
        let emitter = Emitter::new(bus.clone(), "test");
        let tunnels = TunnelSet::open(&[port("tty", 20_000, 7681)], Arc::new(EchoDialer), &emitter)
            .await
            .unwrap();
        let local = tunnels.ports()[0].local;
        assert!(local >= 20_000);

        let mut client = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        tunnels.close().await;
        bus.close().await;
    }

    #[tokio::test]
    async fn dial_failure_ends_only_that_port() {
        let bus = Arc::new(EventBus::new());
        let emitter = Emitter::new(bus.clone(), "test");
        let mut tunnels = TunnelSet::open(
            &[port("tty", 21_000, 7681), port("web", 22_000, 80)],
            Arc::new(FailingDialer),
            &emitter,
        )
        .await
        .unwrap();

        let web = tunnels.ports()[1].local;
        let _client = TcpStream::connect(("127.0.0.1", web)).await.unwrap();
        let error = tunnels.next_error().await.unwrap();
        assert!(format!("{error:#}").contains("tunnel web failed"));

        // the other listener is still accepting
        let tty = tunnels.ports()[0].local;
        assert!(TcpStream::connect(("127.0.0.1", tty)).await.is_ok());

        tunnels.close().await;
        bus.close().await;
    }

    #[tokio::test]
    async fn tunnel_only_without_ports_is_ignored() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |event| sink.lock().unwrap().push(event));
        let emitter = Emitter::new(bus.clone(), "test");

        let interrupt = tokio_util::sync::CancellationToken::new();
        attach_with_tunnels(
            AttachMode::TunnelOnly,
            &[],
            Arc::new(EchoDialer),
            &emitter,
            &interrupt,
            async { anyhow::bail!("shell must not run") },
        )
        .await
        .unwrap();
        bus.close().await;

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|event| event.kind() == EventKind::LogInfo
            && event.message().contains("tunnel ignored")));
    }

    #[tokio::test]
    async fn shell_ends_the_attachment_and_closes_tunnels() {
        let bus = Arc::new(EventBus::new());
        let emitter = Emitter::new(bus.clone(), "test");
        let interrupt = tokio_util::sync::CancellationToken::new();

        let result = attach_with_tunnels(
            AttachMode::ShellAndTunnel,
            &[port("tty", 23_000, 7681)],
            Arc::new(EchoDialer),
            &emitter,
            &interrupt,
            async { Ok(()) },
        )
        .await;
        assert!(result.is_ok());
        bus.close().await;
    }
}
