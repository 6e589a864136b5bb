//! Wire protocol between the heapscope introspection service and its clients.
//!
//! Every message is one frame: `[u32 big-endian payload length][UTF-8 JSON]`.
//! A client opens a connection, writes the 4-byte [`PROTOCOL_MAGIC`], then
//! sends [`RequestFrame`]s. The service answers each with a [`ResponseFrame`]
//! carrying the same `request_id`; answers may arrive out of order.

use facet::Facet;
use heapscope_types::{ObjectAddress, ObjectCount, ObjectLocation};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;
pub const PROTOCOL_MAGIC: u32 = 0x4853_5350;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodecError {
    /// An outgoing payload is over the frame limit.
    PayloadTooLarge { len: usize, max: usize },
    /// An incoming length prefix announces more than the frame limit.
    FrameTooLarge { len: usize, max: usize },
}

impl fmt::Display for FrameCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "refusing to send a {len}-byte frame (limit {max})")
            }
            Self::FrameTooLarge { len, max } => {
                write!(f, "peer announced a {len}-byte frame (limit {max})")
            }
        }
    }
}

impl std::error::Error for FrameCodecError {}

#[derive(Debug)]
pub enum WireError {
    Frame(FrameCodecError),
    Json(String),
    Io(std::io::Error),
    MagicMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "malformed message: {err}"),
            Self::Io(err) => write!(f, "i/o: {err}"),
            Self::MagicMismatch { expected, actual } => write!(
                f,
                "not a heapscope peer: expected magic 0x{expected:08x}, got 0x{actual:08x}"
            ),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FrameCodecError> for WireError {
    fn from(value: FrameCodecError) -> Self {
        Self::Frame(value)
    }
}

impl From<std::io::Error> for WireError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Prefixes `payload` with its big-endian `u32` length.
pub fn encode_frame(payload: &[u8], max_payload_bytes: usize) -> Result<Vec<u8>, FrameCodecError> {
    let too_large = FrameCodecError::PayloadTooLarge {
        len: payload.len(),
        max: max_payload_bytes,
    };
    if payload.len() > max_payload_bytes {
        return Err(too_large);
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large)?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// The four bytes a client sends right after connecting.
pub fn encode_protocol_magic() -> [u8; 4] {
    PROTOCOL_MAGIC.to_be_bytes()
}

/// The four remote operations.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Request {
    GetObjectsCounts,
    GetObjects { type_name: String },
    /// Answered with an empty path when nothing reachable has that address.
    FindObjectPath { address: ObjectAddress },
    RunGc,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Response {
    ObjectsCounts { counts: Vec<ObjectCount> },
    Objects { objects: Vec<ObjectLocation> },
    ObjectPath { path: String },
    GcDone,
    Error { message: String },
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub request_id: u64,
    pub request: Request,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub request_id: u64,
    pub response: Response,
}

pub fn encode_request(
    frame: &RequestFrame,
    max_payload_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    let payload = facet_json::to_vec(frame).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

pub fn encode_response(
    frame: &ResponseFrame,
    max_payload_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    let payload = facet_json::to_vec(frame).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

/// Reads one frame payload.
///
/// `Ok(None)` means the peer closed cleanly between frames. A stream that ends
/// partway through the length prefix or the payload is an I/O error.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload_bytes: usize,
) -> Result<Option<Vec<u8>>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[first..]).await?;

    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > max_payload_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            len: payload_len,
            max: max_payload_bytes,
        }
        .into());
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn read_request<R>(
    reader: &mut R,
    max_payload_bytes: usize,
) -> Result<Option<RequestFrame>, WireError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_payload_bytes).await? {
        Some(payload) => facet_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| WireError::Json(e.to_string())),
        None => Ok(None),
    }
}

pub async fn read_response<R>(
    reader: &mut R,
    max_payload_bytes: usize,
) -> Result<Option<ResponseFrame>, WireError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_payload_bytes).await? {
        Some(payload) => facet_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| WireError::Json(e.to_string())),
        None => Ok(None),
    }
}

/// Writes an already-encoded frame and flushes.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_protocol_magic<R>(reader: &mut R) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).await?;
    let actual = u32::from_be_bytes(bytes);
    if actual != PROTOCOL_MAGIC {
        return Err(WireError::MagicMismatch {
            expected: PROTOCOL_MAGIC,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_json(frame: Vec<u8>) -> String {
        let (prefix, payload) = frame.split_at(4);
        assert_eq!(
            u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize,
            payload.len()
        );
        String::from_utf8(payload.to_vec()).expect("payload should be utf8 json")
    }

    fn is_unexpected_eof(err: &WireError) -> bool {
        matches!(err, WireError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }

    fn request_json(frame: &RequestFrame) -> String {
        payload_json(encode_request(frame, DEFAULT_MAX_FRAME_BYTES).expect("encode request"))
    }

    #[test]
    fn get_objects_wire_shape() {
        let json = request_json(&RequestFrame {
            request_id: 7,
            request: Request::GetObjects {
                type_name: "Gtk.Button".into(),
            },
        });
        assert_eq!(
            json,
            r#"{"request_id":7,"request":{"get_objects":{"type_name":"Gtk.Button"}}}"#
        );
    }

    #[test]
    fn find_object_path_wire_shape() {
        let json = request_json(&RequestFrame {
            request_id: 8,
            request: Request::FindObjectPath {
                address: ObjectAddress::new(4096),
            },
        });
        assert_eq!(
            json,
            r#"{"request_id":8,"request":{"find_object_path":{"address":4096}}}"#
        );
    }

    #[test]
    fn object_path_response_wire_shape() {
        let frame = ResponseFrame {
            request_id: 8,
            response: Response::ObjectPath {
                path: "window.c[1].x".into(),
            },
        };
        let json = payload_json(encode_response(&frame, DEFAULT_MAX_FRAME_BYTES).expect("encode"));
        assert_eq!(
            json,
            r#"{"request_id":8,"response":{"object_path":{"path":"window.c[1].x"}}}"#
        );
    }

    #[tokio::test]
    async fn every_request_kind_reads_back() {
        let requests = [
            Request::GetObjectsCounts,
            Request::GetObjects {
                type_name: "Foo".into(),
            },
            Request::FindObjectPath {
                address: ObjectAddress::new(u64::MAX),
            },
            Request::RunGc,
        ];
        let mut stream = Vec::new();
        let mut sent = Vec::new();
        for (request_id, request) in requests.into_iter().enumerate() {
            let frame = RequestFrame {
                request_id: request_id as u64,
                request,
            };
            stream.extend(encode_request(&frame, DEFAULT_MAX_FRAME_BYTES).expect("encode"));
            sent.push(frame);
        }

        let mut reader = stream.as_slice();
        let mut received = Vec::new();
        while let Some(frame) = read_request(&mut reader, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read")
        {
            received.push(frame);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_on_both_ends() {
        let err = encode_frame(&[0u8; 16], 8).expect_err("payload over max must fail");
        assert_eq!(err, FrameCodecError::PayloadTooLarge { len: 16, max: 8 });

        let frame = encode_frame(&[0u8; 16], 64).expect("frame should encode");
        let err = read_frame(&mut frame.as_slice(), 8)
            .await
            .expect_err("frame over max must fail");
        assert!(
            matches!(
                err,
                WireError::Frame(FrameCodecError::FrameTooLarge { len: 16, max: 8 })
            ),
            "{err}"
        );
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let mut frame = encode_frame(b"{}", 64).expect("frame should encode");
        frame.pop();
        let err = read_frame(&mut frame.as_slice(), 64)
            .await
            .expect_err("short payload must fail");
        assert!(is_unexpected_eof(&err), "{err}");
    }

    #[tokio::test]
    async fn eof_inside_the_length_prefix_is_an_error() {
        let frame = encode_frame(b"{}", 64).expect("frame should encode");
        let err = read_frame(&mut &frame[..2], 64)
            .await
            .expect_err("half a length prefix is not a clean close");
        assert!(is_unexpected_eof(&err), "{err}");

        let empty: &[u8] = &[];
        assert!(read_frame(&mut &empty[..], 64).await.expect("clean close").is_none());
    }

    #[tokio::test]
    async fn protocol_magic_mismatch_is_reported() {
        read_protocol_magic(&mut &encode_protocol_magic()[..])
            .await
            .expect("own magic is accepted");
        let err = read_protocol_magic(&mut &b"MOIR"[..])
            .await
            .expect_err("foreign magic must fail");
        assert!(matches!(err, WireError::MagicMismatch { .. }));
    }

    #[tokio::test]
    async fn async_reader_sees_frames_then_clean_eof() {
        let first = encode_response(
            &ResponseFrame {
                request_id: 1,
                response: Response::GcDone,
            },
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &first).await.expect("write");
        drop(client);

        let frame = read_response(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read")
            .expect("one frame");
        assert_eq!(frame.response, Response::GcDone);
        let eof = read_response(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("clean eof");
        assert!(eof.is_none());
    }
}
