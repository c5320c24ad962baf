// Copyright (c) 2025 The acmedns authors
// SPDX-License-Identifier: MIT

//! Server lifecycle: two listeners, one address.
//!
//! [`Server::start`] binds a UDP socket and a TCP listener on the same
//! address, sequentially, and hands back a [`RunningServer`]. Requests are
//! handled on their own tasks; both transports share one [`Engine`]. If a
//! listener's serve loop dies while the server is running, a supervisor
//! shuts the other one down so the process never limps along half-deaf.

use crate::backend::DynBackend;
use crate::config::Config;
use crate::constants::{SHUTDOWN_GRACE_SECS, TCP_IDLE_TIMEOUT_SECS};
use crate::dns::handler::Engine;
use crate::errors::{Error, ServerError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A configured but not yet started server.
pub struct Server {
    listen: SocketAddr,
    nameservers: Vec<String>,
    backend: DynBackend,
}

impl Server {
    /// Validate the configuration and prepare a server.
    pub fn new(config: &Config, backend: DynBackend) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            listen: config.listen,
            nameservers: config.nameservers.clone(),
            backend,
        })
    }

    /// Bind both listeners and start serving.
    ///
    /// Listeners start sequentially; if the second one fails to come up the
    /// first is shut down again before the error is returned. `cancel`
    /// bounds the startup itself and, once running, stops in-flight backend
    /// waits on shutdown.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<RunningServer, Error> {
        let requests = cancel.child_token();
        let engine = Arc::new(Engine::new(
            &self.nameservers,
            self.backend.clone(),
            requests.clone(),
        )?);

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let mut listeners: Vec<Arc<Listener>> = Vec::with_capacity(2);
        for proto in [Proto::Udp, Proto::Tcp] {
            match Listener::start(proto, self.listen, engine.clone(), fatal_tx.clone(), cancel)
                .await
            {
                Ok(listener) => listeners.push(Arc::new(listener)),
                Err(err) => {
                    for started in &listeners {
                        if let Err(stop_err) = started.stop().await {
                            warn!(error = %stop_err, "error stopping listener after failed startup");
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        info!(addr = %self.listen, "DNS server listening on UDP and TCP");

        let stopping = Arc::new(AtomicBool::new(false));
        let supervisor = tokio::spawn(supervise(fatal_rx, listeners.clone(), stopping.clone()));

        Ok(RunningServer {
            listeners,
            requests,
            stopping,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }
}

/// A started server. Stop it with [`RunningServer::stop`].
pub struct RunningServer {
    listeners: Vec<Arc<Listener>>,
    requests: CancellationToken,
    stopping: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RunningServer {
    /// Shut down all listeners concurrently and wait for them.
    ///
    /// Returns the first listener failure wrapped as
    /// `SERVER_SHUTDOWN_FAILED`; the remaining listeners are still stopped.
    pub async fn stop(&self) -> Result<(), Error> {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }
        self.requests.cancel();

        let results =
            futures::future::join_all(self.listeners.iter().map(|listener| listener.stop())).await;
        let mut first_failure = None;
        for result in results {
            if let Err(err) = result {
                warn!(error = %err, "listener shutdown failed");
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(ServerError::ShutdownFailed {
                source: Box::new(err),
            }
            .into()),
            None => {
                info!("DNS server stopped");
                Ok(())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    fn name(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

struct Listener {
    proto: Proto,
    shutdown: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<Result<(), ServerError>>>>,
}

impl Listener {
    /// Bind the socket and spawn the serve loop. Binding is guarded by the
    /// caller's cancellation; a fired token reports `SERVER_START_TIMEOUT`.
    async fn start(
        proto: Proto,
        addr: SocketAddr,
        engine: Arc<Engine>,
        fatal_tx: mpsc::UnboundedSender<Proto>,
        cancel: &CancellationToken,
    ) -> Result<Self, ServerError> {
        let shutdown = CancellationToken::new();
        let serve_task = match proto {
            Proto::Udp => {
                let socket = tokio::select! {
                    bound = UdpSocket::bind(addr) => bound.map_err(|source| ServerError::Bind {
                        proto: proto.name(),
                        addr,
                        source,
                    })?,
                    () = cancel.cancelled() => return Err(ServerError::StartTimeout),
                };
                debug!(addr = %addr, "UDP listener bound");
                tokio::spawn(serve_udp(socket, engine, shutdown.clone(), fatal_tx))
            }
            Proto::Tcp => {
                let listener = tokio::select! {
                    bound = TcpListener::bind(addr) => bound.map_err(|source| ServerError::Bind {
                        proto: proto.name(),
                        addr,
                        source,
                    })?,
                    () = cancel.cancelled() => return Err(ServerError::StartTimeout),
                };
                debug!(addr = %addr, "TCP listener bound");
                tokio::spawn(serve_tcp(listener, engine, shutdown.clone(), fatal_tx))
            }
        };
        Ok(Self {
            proto,
            shutdown,
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    /// Signal the serve loop to exit and wait for it, bounded by the
    /// shutdown grace period. Safe to call more than once.
    async fn stop(&self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        let task = self
            .serve_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };
        match tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), task).await {
            Err(_) => Err(ServerError::ShutdownTimeout {
                proto: self.proto.name(),
            }),
            Ok(Err(join_err)) => Err(ServerError::ListenerShutdownFailed {
                proto: self.proto.name(),
                reason: join_err.to_string(),
            }),
            Ok(Ok(Err(serve_err))) => Err(ServerError::ListenerShutdownFailed {
                proto: self.proto.name(),
                reason: serve_err.to_string(),
            }),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}

/// Shut down the remaining listeners when one serve loop dies while the
/// server is supposed to be running.
async fn supervise(
    mut fatal_rx: mpsc::UnboundedReceiver<Proto>,
    listeners: Vec<Arc<Listener>>,
    stopping: Arc<AtomicBool>,
) {
    if let Some(proto) = fatal_rx.recv().await {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        warn!(
            listener = proto.name(),
            "listener failed, shutting down the remaining listeners"
        );
        for listener in &listeners {
            if listener.proto != proto {
                listener.shutdown.cancel();
            }
        }
    }
}

async fn serve_udp(
    socket: UdpSocket,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<Proto>,
) -> Result<(), ServerError> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 65_535];
    loop {
        let (len, peer) = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(source) => {
                    error!(error = %source, "UDP receive failed, stopping listener");
                    let _ = fatal_tx.send(Proto::Udp);
                    return Err(ServerError::Serve {
                        proto: "udp",
                        source,
                    });
                }
            },
        };
        let datagram = buf[..len].to_vec();
        let engine = engine.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            if let Some(response) = engine.handle(&datagram).await {
                if let Err(err) = socket.send_to(&response, peer).await {
                    debug!(peer = %peer, error = %err, "cannot send UDP response");
                }
            }
        });
    }
}

async fn serve_tcp(
    listener: TcpListener,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<Proto>,
) -> Result<(), ServerError> {
    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(source) => {
                    error!(error = %source, "TCP accept failed, stopping listener");
                    let _ = fatal_tx.send(Proto::Tcp);
                    return Err(ServerError::Serve {
                        proto: "tcp",
                        source,
                    });
                }
            },
        };
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_tcp_connection(stream, engine, shutdown).await {
                debug!(peer = %peer, error = %err, "TCP connection closed with error");
            }
        });
    }
}

/// Serve length-framed messages on one connection until the client goes
/// away, the idle timeout strikes, or the listener shuts down.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let idle = Duration::from_secs(TCP_IDLE_TIMEOUT_SECS);
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            read = tokio::time::timeout(idle, read_tcp_message(&mut stream)) => match read {
                Ok(Ok(message)) => message,
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(err)) => return Err(err),
                Err(_) => return Ok(()),
            },
        };
        if let Some(response) = engine.handle(&message).await {
            write_tcp_message(&mut stream, &response).await?;
        }
    }
}

async fn read_tcp_message(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    if len == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "zero-length TCP message",
        ));
    }
    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}

async fn write_tcp_message(stream: &mut TcpStream, message: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(message.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "response exceeds 64 KiB")
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(message).await?;
    stream.flush().await
}
