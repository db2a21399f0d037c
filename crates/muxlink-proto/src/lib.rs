//! Wire framing exchanged with the parent relay endpoint.
//!
//! Two header shapes open every conversation:
//!
//! ```text
//! identify   +-----+----------------+----------------------+
//!            | 0x04| u16 len | key  | u16 len | server_id  |
//!            +-----+----------------+----------------------+
//! flow-open  +-----+------------------+---------------------+---------------------+
//!            | 0x05| u16 len | flow_id| u16 len | dest      | u16 len | server_id |
//!            +-----+------------------+---------------------+---------------------+
//! ```
//!
//! The identify header is written once on a freshly dialed parent connection
//! before it is wrapped as a multiplexing session. The flow-open header is
//! written once per opened stream; `dest` is the destination address string
//! prefixed with `tcp:` or `udp:`.
//!
//! UDP payloads relayed over a stream are wrapped with the originating source
//! address so the parent can route replies:
//!
//! ```text
//! +------------------+--------------------+
//! | u16 len | src    | u16 len | payload  |
//! +------------------+--------------------+
//! ```
//!
//! All length prefixes are big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Control-channel command byte (reserved, not used by this relay).
pub const CMD_CLIENT_CONTROL: u8 = 1;
/// Session-identify command: this connection is a session channel for a relay instance.
pub const CMD_SERVER: u8 = 4;
/// Flow-open command: this stream carries one relayed flow.
pub const CMD_CLIENT: u8 = 5;

/// Maximum length of any length-prefixed field.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;
/// Maximum UDP payload carried in a single frame.
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize;

/// Frame construction errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("field too long ({0} bytes)")]
    FieldTooLong(usize),

    #[error("udp payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
}

/// A parsed handshake header, as read by the parent side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// Announces a new session channel for relay instance `server_id` using `key`.
    Identify { key: String, server_id: String },
    /// Announces a relayed flow on a freshly opened stream.
    FlowOpen {
        flow_id: String,
        dest: String,
        server_id: String,
    },
}

/// Build the session-identify header written once per parent connection.
pub fn build_identify(key: &str, server_id: &str) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(1 + 2 + key.len() + 2 + server_id.len());
    buf.put_u8(CMD_SERVER);
    put_field(&mut buf, key.as_bytes())?;
    put_field(&mut buf, server_id.as_bytes())?;
    Ok(buf.freeze())
}

/// Build the flow-open header written once per opened stream.
pub fn build_flow_open(flow_id: &str, dest: &str, server_id: &str) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(
        1 + 2 + flow_id.len() + 2 + dest.len() + 2 + server_id.len(),
    );
    buf.put_u8(CMD_CLIENT);
    put_field(&mut buf, flow_id.as_bytes())?;
    put_field(&mut buf, dest.as_bytes())?;
    put_field(&mut buf, server_id.as_bytes())?;
    Ok(buf.freeze())
}

/// Wrap one UDP datagram with its source address for transport over a stream.
pub fn build_udp_frame(src_addr: &str, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(2 + src_addr.len() + 2 + payload.len());
    put_field(&mut buf, src_addr.as_bytes())?;
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn put_field(buf: &mut BytesMut, data: &[u8]) -> Result<(), FrameError> {
    if data.len() > MAX_FIELD_LEN {
        return Err(FrameError::FieldTooLong(data.len()));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Read a handshake header from the stream.
///
/// Frame violations surface as `io::ErrorKind::InvalidData` so callers can
/// treat them uniformly with transport errors.
pub async fn read_header<R>(reader: &mut R) -> std::io::Result<Header>
where
    R: AsyncRead + Unpin,
{
    let cmd = reader.read_u8().await?;
    match cmd {
        CMD_SERVER => {
            let key = read_string(reader).await?;
            let server_id = read_string(reader).await?;
            Ok(Header::Identify { key, server_id })
        }
        CMD_CLIENT => {
            let flow_id = read_string(reader).await?;
            let dest = read_string(reader).await?;
            let server_id = read_string(reader).await?;
            Ok(Header::FlowOpen {
                flow_id,
                dest,
                server_id,
            })
        }
        other => Err(invalid_data(format!("unknown command byte {other:#x}"))),
    }
}

/// Read one wrapped UDP datagram from the stream, returning the source
/// address string and the raw payload.
pub async fn read_udp_frame<R>(reader: &mut R) -> std::io::Result<(String, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let src = read_string(reader).await?;
    let len = reader.read_u16().await? as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((src, payload))
}

async fn read_string<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| invalid_data("field is not valid utf-8".into()))
}

fn invalid_data(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identify_roundtrip() {
        let bytes = build_identify("secret", "srv-1").unwrap();
        let mut cursor = &bytes[..];
        let header = read_header(&mut cursor).await.unwrap();
        assert_eq!(
            header,
            Header::Identify {
                key: "secret".into(),
                server_id: "srv-1".into(),
            }
        );
    }

    #[tokio::test]
    async fn flow_open_roundtrip() {
        let bytes = build_flow_open("f-42", "tcp:203.0.113.5:80", "srv-1").unwrap();
        let mut cursor = &bytes[..];
        let header = read_header(&mut cursor).await.unwrap();
        assert_eq!(
            header,
            Header::FlowOpen {
                flow_id: "f-42".into(),
                dest: "tcp:203.0.113.5:80".into(),
                server_id: "srv-1".into(),
            }
        );
    }

    #[tokio::test]
    async fn udp_frame_roundtrip() {
        let bytes = build_udp_frame("198.51.100.9:5353", b"ping").unwrap();
        let mut cursor = &bytes[..];
        let (src, payload) = read_udp_frame(&mut cursor).await.unwrap();
        assert_eq!(src, "198.51.100.9:5353");
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn udp_frame_empty_payload() {
        let bytes = build_udp_frame("10.0.0.1:53", b"").unwrap();
        let mut cursor = &bytes[..];
        let (src, payload) = read_udp_frame(&mut cursor).await.unwrap();
        assert_eq!(src, "10.0.0.1:53");
        assert!(payload.is_empty());
    }

    #[test]
    fn udp_frame_payload_too_large() {
        let payload = vec![0u8; MAX_UDP_PAYLOAD + 1];
        let res = build_udp_frame("10.0.0.1:53", &payload);
        assert_eq!(res, Err(FrameError::PayloadTooLarge(MAX_UDP_PAYLOAD + 1)));
    }

    #[tokio::test]
    async fn unknown_command_rejected() {
        let bytes = [0x7fu8, 0, 0];
        let mut cursor = &bytes[..];
        let err = read_header(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_header_is_eof() {
        // Length prefix claims 5 bytes but only 2 follow.
        let bytes = [CMD_SERVER, 0, 5, b'a', b'b'];
        let mut cursor = &bytes[..];
        let err = read_header(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn header_sequence_on_one_stream() {
        // Identify followed by flow-open, as the parent observes them on a
        // fresh connection that is then multiplexed.
        let mut wire = Vec::new();
        wire.extend_from_slice(&build_identify("k", "s").unwrap());
        wire.extend_from_slice(&build_flow_open("f", "udp:10.0.0.1:53", "s").unwrap());
        let mut cursor = &wire[..];
        assert!(matches!(
            read_header(&mut cursor).await.unwrap(),
            Header::Identify { .. }
        ));
        assert!(matches!(
            read_header(&mut cursor).await.unwrap(),
            Header::FlowOpen { .. }
        ));
    }
}
