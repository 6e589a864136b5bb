use heapscope_types::{ObjectAddress, ObjectCount, ObjectLocation};
use heapscope_wire::{
    DEFAULT_MAX_FRAME_BYTES, Request, RequestFrame, Response, ResponseFrame, WireError,
    encode_protocol_magic, encode_request, read_response, write_frame,
};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

pub const DEFAULT_ADDR: &str = "127.0.0.1:9140";
pub const ADDR_ENV: &str = "HEAPSCOPE_ADDR";

/// `$HEAPSCOPE_ADDR`, or the service's default listen address.
pub fn default_addr() -> String {
    std::env::var(ADDR_ENV)
        .ok()
        .filter(|addr| !addr.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

#[derive(Debug)]
pub enum ClientError {
    /// Nothing is listening at the address: the host exited or never started
    /// its service.
    Unavailable {
        addr: String,
        source: std::io::Error,
    },
    Io(std::io::Error),
    Wire(WireError),
    /// The service answered with an error message.
    Remote(String),
    UnexpectedResponse {
        request_id: u64,
        got: String,
    },
    /// The service closed the connection before answering, or an earlier
    /// call left the connection out of step with the service.
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { addr, source } => {
                write!(f, "memory service at {addr} is unavailable: {source}")
            }
            Self::Io(e) => write!(f, "i/o: {e}"),
            Self::Wire(e) => write!(f, "wire: {e}"),
            Self::Remote(message) => write!(f, "memory service error: {message}"),
            Self::UnexpectedResponse { request_id, got } => {
                write!(f, "unexpected response to request {request_id}: {got}")
            }
            Self::Closed => write!(f, "memory service closed the connection"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unavailable { source, .. } | Self::Io(source) => Some(source),
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for ClientError {
    fn from(value: WireError) -> Self {
        Self::Wire(value)
    }
}

/// Connection to one host's introspection service.
///
/// Requests go out one at a time; each call waits for its own answer. After
/// a transport failure or an answer carrying the wrong request id, every
/// later call fails with [`ClientError::Closed`].
pub struct MemoryProxy {
    peer: SocketAddr,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    next_request_id: u64,
    max_frame_bytes: usize,
    broken: bool,
}

impl MemoryProxy {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        Self::connect_with_limit(addr, DEFAULT_MAX_FRAME_BYTES).await
    }

    pub async fn connect_with_limit(
        addr: &str,
        max_frame_bytes: usize,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Unavailable {
                addr: addr.to_string(),
                source,
            })?;
        let peer = stream.peer_addr().map_err(ClientError::Io)?;
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(&encode_protocol_magic())
            .await
            .map_err(ClientError::Io)?;
        debug!(%peer, "connected to memory service");
        Ok(Self {
            peer,
            reader,
            writer,
            next_request_id: 1,
            max_frame_bytes,
            broken: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        if self.broken {
            return Err(ClientError::Closed);
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let frame = encode_request(
            &RequestFrame {
                request_id,
                request,
            },
            self.max_frame_bytes,
        )?;
        let answer = match self.exchange(request_id, &frame).await {
            Ok(answer) => answer,
            Err(e) => {
                debug!(peer = %self.peer, %e, "memory service connection unusable");
                self.broken = true;
                return Err(e);
            }
        };
        match answer.response {
            Response::Error { message } => Err(ClientError::Remote(message)),
            response => Ok(response),
        }
    }

    async fn exchange(
        &mut self,
        request_id: u64,
        frame: &[u8],
    ) -> Result<ResponseFrame, ClientError> {
        write_frame(&mut self.writer, frame).await?;
        let Some(answer) = read_response(&mut self.reader, self.max_frame_bytes).await? else {
            return Err(ClientError::Closed);
        };
        if answer.request_id != request_id {
            return Err(ClientError::UnexpectedResponse {
                request_id,
                got: format!("answer to request {}", answer.request_id),
            });
        }
        Ok(answer)
    }

    pub async fn get_objects_counts(&mut self) -> Result<Vec<ObjectCount>, ClientError> {
        let request_id = self.next_request_id;
        match self.call(Request::GetObjectsCounts).await? {
            Response::ObjectsCounts { counts } => Ok(counts),
            other => Err(unexpected(request_id, &other)),
        }
    }

    pub async fn get_objects(
        &mut self,
        type_name: &str,
    ) -> Result<Vec<ObjectLocation>, ClientError> {
        let request_id = self.next_request_id;
        let request = Request::GetObjects {
            type_name: type_name.to_string(),
        };
        match self.call(request).await? {
            Response::Objects { objects } => Ok(objects),
            other => Err(unexpected(request_id, &other)),
        }
    }

    /// Empty string when the object is not reachable from the host's root.
    pub async fn find_object_path(
        &mut self,
        address: ObjectAddress,
    ) -> Result<String, ClientError> {
        let request_id = self.next_request_id;
        match self.call(Request::FindObjectPath { address }).await? {
            Response::ObjectPath { path } => Ok(path),
            other => Err(unexpected(request_id, &other)),
        }
    }

    pub async fn run_gc(&mut self) -> Result<(), ClientError> {
        let request_id = self.next_request_id;
        match self.call(Request::RunGc).await? {
            Response::GcDone => Ok(()),
            other => Err(unexpected(request_id, &other)),
        }
    }
}

fn unexpected(request_id: u64, response: &Response) -> ClientError {
    ClientError::UnexpectedResponse {
        request_id,
        got: format!("{response:?}"),
    }
}
