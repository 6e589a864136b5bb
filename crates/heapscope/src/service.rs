//! The introspection service: four census and resolution operations served
//! to remote callers over TCP.
//!
//! [`MemoryHandler`] is the transport-agnostic part. [`MemoryService`] owns
//! the listener and its lifecycle; callers construct it, start it with a root,
//! and stop it when done. Nothing here is process-global.

use heapscope_types::{ObjectAddress, ObjectCount, ObjectLocation};
use heapscope_wire::{
    Request, Response, ResponseFrame, WireError, encode_response, read_protocol_magic,
    read_request, write_frame,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::census::HeapHost;
use crate::config::ServiceConfig;
use crate::resolver::ResolverConfig;

const RESPONSE_QUEUE_DEPTH: usize = 64;

pub struct MemoryHandler<H: HeapHost> {
    host: Arc<H>,
    root: H::Root,
    resolver: ResolverConfig,
}

impl<H: HeapHost> MemoryHandler<H> {
    pub fn new(host: Arc<H>, root: H::Root, resolver: ResolverConfig) -> Self {
        Self {
            host,
            root,
            resolver,
        }
    }

    pub fn count_objects(&self) -> Vec<ObjectCount> {
        self.host.object_counts()
    }

    /// Live instances of `type_name`; empty for unknown types.
    pub fn list_objects(&self, type_name: &str) -> Vec<ObjectLocation> {
        let mut objects = self.host.objects_of_type(type_name);
        objects.retain(|object| object.type_name == type_name);
        objects
    }

    /// Reference path from the configured root to `address`, or an empty
    /// string when nothing reachable lives there.
    pub fn resolve_address(&self, address: ObjectAddress) -> String {
        let outcome = self.host.find_path(self.root, address, &self.resolver);
        debug!(
            %address,
            found = outcome.path.is_some(),
            visited = outcome.visited,
            stop = ?outcome.stop,
            "resolved object address"
        );
        outcome.path_string()
    }

    pub fn force_collect(&self) {
        self.host.collect_garbage();
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::GetObjectsCounts => Response::ObjectsCounts {
                counts: self.count_objects(),
            },
            Request::GetObjects { type_name } => Response::Objects {
                objects: self.list_objects(&type_name),
            },
            Request::FindObjectPath { address } => Response::ObjectPath {
                path: self.resolve_address(address),
            },
            Request::RunGc => {
                self.force_collect();
                Response::GcDone
            }
        }
    }
}

#[derive(Debug)]
pub enum ServiceError {
    Bind {
        addr: String,
        source: std::io::Error,
    },
    LocalAddr(std::io::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            Self::LocalAddr(source) => write!(f, "failed to read bound address: {source}"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } | Self::LocalAddr(source) => Some(source),
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

pub struct MemoryService<H: HeapHost> {
    host: Arc<H>,
    config: ServiceConfig,
    running: Option<Running>,
}

impl<H: HeapHost> MemoryService<H> {
    pub fn new(host: Arc<H>, config: ServiceConfig) -> Self {
        Self {
            host,
            config,
            running: None,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Binds the listener and starts serving `root`.
    ///
    /// Starting a running service is a no-op that returns the address already
    /// bound; `root` is ignored in that case.
    pub async fn start(&mut self, root: H::Root) -> Result<SocketAddr, ServiceError> {
        if let Some(running) = &self.running {
            debug!(local_addr = %running.local_addr, "memory service already running");
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServiceError::LocalAddr)?;

        let handler = Arc::new(MemoryHandler::new(
            Arc::clone(&self.host),
            root,
            self.config.resolver.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let acceptor = tokio::spawn(run_acceptor(
            listener,
            handler,
            self.config.max_frame_bytes,
            shutdown_rx,
        ));
        info!(%local_addr, "memory service listening");

        self.running = Some(Running {
            local_addr,
            shutdown,
            acceptor,
        });
        Ok(local_addr)
    }

    /// Stops accepting, closes every connection and waits for the listener
    /// task. Stopping a stopped service is a no-op.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.acceptor.await {
            warn!(%e, "memory service acceptor ended abnormally");
        }
        info!(local_addr = %running.local_addr, "memory service stopped");
    }
}

impl<H: HeapHost> Drop for MemoryService<H> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn run_acceptor<H: HeapHost>(
    listener: TcpListener,
    handler: Arc<MemoryHandler<H>>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "memory service connection accepted");
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        match serve_connection(stream, handler, max_frame_bytes, shutdown).await {
                            Ok(()) => debug!(%peer, "memory service connection closed"),
                            Err(e) => warn!(%peer, %e, "memory service connection closed"),
                        }
                    });
                }
                Err(e) => warn!(%e, "memory service accept error"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn serve_connection<H: HeapHost>(
    stream: TcpStream,
    handler: Arc<MemoryHandler<H>>,
    max_frame_bytes: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<(), WireError> {
    let (mut reader, writer) = stream.into_split();
    read_protocol_magic(&mut reader).await?;

    let (tx, rx) = mpsc::channel::<ResponseFrame>(RESPONSE_QUEUE_DEPTH);
    let (read_result, write_result) = tokio::join!(
        read_requests(reader, handler, max_frame_bytes, shutdown, tx),
        write_responses(writer, rx, max_frame_bytes)
    );
    read_result.and(write_result)
}

/// Reads request frames until EOF, shutdown, or the writer going away. Each
/// request runs on the blocking pool so several can be in flight on one
/// connection; answers go to the single writer through `tx`. On EOF the
/// requests already read are answered before returning.
async fn read_requests<H: HeapHost>(
    mut reader: OwnedReadHalf,
    handler: Arc<MemoryHandler<H>>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<ResponseFrame>,
) -> Result<(), WireError> {
    let mut in_flight = JoinSet::new();
    loop {
        while in_flight.try_join_next().is_some() {}
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = tx.closed() => {
                debug!("response writer gone, no longer reading requests");
                return Ok(());
            }
            frame = read_request(&mut reader, max_frame_bytes) => frame?,
        };
        let Some(frame) = frame else {
            break;
        };
        let handler = Arc::clone(&handler);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let request_id = frame.request_id;
            let request = frame.request;
            let response = match tokio::task::spawn_blocking(move || handler.handle(request)).await
            {
                Ok(response) => response,
                Err(e) => Response::Error {
                    message: format!("request handler failed: {e}"),
                },
            };
            if tx
                .send(ResponseFrame {
                    request_id,
                    response,
                })
                .await
                .is_err()
            {
                debug!(request_id, "response dropped, writer is gone");
            }
        });
    }
    while in_flight.join_next().await.is_some() {}
    Ok(())
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ResponseFrame>,
    max_frame_bytes: usize,
) -> Result<(), WireError> {
    while let Some(frame) = rx.recv().await {
        let bytes = match encode_response(&frame, max_frame_bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(request_id = frame.request_id, %e, "response does not fit in a frame");
                let fallback = ResponseFrame {
                    request_id: frame.request_id,
                    response: Response::Error {
                        message: format!("response too large: {e}"),
                    },
                };
                encode_response(&fallback, max_frame_bytes)?
            }
        };
        write_frame(&mut writer, &bytes).await?;
    }
    Ok(())
}
