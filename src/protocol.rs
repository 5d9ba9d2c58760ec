//! PostgreSQL v3 wire protocol framing, encoding and decoding.
//!
//! Layout of a typed message is `[type: u8][length: i32][body]`, where the
//! length counts itself but not the type byte. Startup and cancel-request
//! messages are untyped (`[length: i32][body]`). Encoders write a four-byte
//! placeholder and backfill the length once the body is complete.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result, ServerError};
use crate::types::Oid;

/// PostgreSQL protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// CancelRequest magic code.
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Transaction status byte carried by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// `I`: idle, not in a transaction block.
    #[default]
    Idle,
    /// `T`: inside a transaction block.
    InTransaction,
    /// `E`: inside a failed transaction block.
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Byte codec primitives
// ============================================================================

/// Write a NUL-terminated UTF-8 string. Embedded NUL bytes are rejected since
/// they would desynchronize the frame.
pub fn put_cstr(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::protocol("string contains an embedded NUL byte"));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Write an i32-length-prefixed byte string; `None` encodes as length −1.
pub fn put_bytes_lp(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(d) => {
            buf.put_i32(d.len() as i32);
            buf.put_slice(d);
        }
        None => buf.put_i32(-1),
    }
}

/// Read a NUL-terminated UTF-8 string, advancing past the terminator.
pub fn get_cstr(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::protocol("missing NUL terminator in string"))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::protocol(format!("invalid UTF-8: {e}")))
}

/// Read an i32-length-prefixed byte string; length −1 decodes as `None`.
pub fn get_bytes_lp(buf: &mut Bytes) -> Result<Option<Bytes>> {
    if buf.remaining() < 4 {
        return Err(Error::protocol("truncated length prefix"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(Error::protocol("truncated length-prefixed bytes"));
    }
    Ok(Some(buf.split_to(len)))
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::protocol(format!("truncated {what}")));
    }
    Ok(())
}

/// Frame a message body: optional tag byte, a length placeholder, the body
/// written by `body`, then the length backfilled as `end - length_start`.
/// A `tag` of 0 produces an untyped frame.
pub fn frame(
    buf: &mut BytesMut,
    tag: u8,
    body: impl FnOnce(&mut BytesMut) -> Result<()>,
) -> Result<()> {
    if tag != 0 {
        buf.put_u8(tag);
    }
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf)?;
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

// ============================================================================
// Incoming frame header
// ============================================================================

/// The five-byte header framing every backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u8,
    pub len: i32,
}

impl Header {
    pub const SIZE: usize = 5;

    /// Parse a header from the first five buffered bytes.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        debug_assert!(buf.len() >= Self::SIZE);
        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(Error::protocol(format!("invalid message length {len}")));
        }
        Ok(Header { tag, len })
    }

    /// Body size in bytes (the length field counts itself).
    pub fn body_len(&self) -> usize {
        self.len as usize - 4
    }
}

// ============================================================================
// Frontend (client -> server) messages
// ============================================================================

/// A message the client can send. Encoding appends one complete frame.
pub trait FrontendMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()>;
}

/// Encode a message into a fresh buffer. Test and one-shot helper.
pub fn encode_frame<M: FrontendMessage>(msg: &M) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    msg.encode(&mut buf)?;
    Ok(buf)
}

/// Untyped startup message: protocol version plus NUL-separated parameter
/// pairs, closed by a trailing zero byte.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub params: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, 0, |b| {
            b.put_i32(PROTOCOL_VERSION);
            for (name, value) in &self.params {
                put_cstr(b, name)?;
                put_cstr(b, value)?;
            }
            b.put_u8(0);
            Ok(())
        })
    }
}

/// Untyped cancel request, sent on a dedicated connection.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, 0, |b| {
            b.put_i32(CANCEL_REQUEST_CODE);
            b.put_i32(self.process_id);
            b.put_i32(self.secret_key);
            Ok(())
        })
    }
}

/// Cleartext password response ('p').
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'p', |b| put_cstr(b, &self.password))
    }
}

/// First SASL response ('p'): mechanism name plus initial client data.
#[derive(Debug, Clone)]
pub struct SaslInitialResponse {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'p', |b| {
            put_cstr(b, &self.mechanism)?;
            put_bytes_lp(b, Some(&self.data));
            Ok(())
        })
    }
}

/// Subsequent SASL response ('p'): bare mechanism data.
#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'p', |b| {
            b.put_slice(&self.data);
            Ok(())
        })
    }
}

/// Parse ('P'): create a named prepared statement.
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub statement: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'P', |b| {
            put_cstr(b, self.statement)?;
            put_cstr(b, self.query)?;
            b.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                b.put_i32(oid.as_i32());
            }
            Ok(())
        })
    }
}

/// Bind ('B'): bind text-format parameters to a statement, creating a portal.
/// Empty format-code lists mean "all text" on both sides.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Option<String>],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'B', |b| {
            put_cstr(b, self.portal)?;
            put_cstr(b, self.statement)?;
            b.put_i16(0); // parameter format codes: default text
            b.put_i16(self.params.len() as i16);
            for param in self.params {
                put_bytes_lp(b, param.as_deref().map(str::as_bytes));
            }
            b.put_i16(0); // result format codes: default text
            Ok(())
        })
    }
}

/// Describe ('D') a statement (`'S'`) or portal (`'P'`).
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name)
        })
    }
}

/// Execute ('E') a portal; `row_limit` 0 means no limit.
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    pub row_limit: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'E', |b| {
            put_cstr(b, self.portal)?;
            b.put_i32(self.row_limit);
            Ok(())
        })
    }
}

/// Close ('C') a statement (`'S'`) or portal (`'P'`).
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'C', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name)
        })
    }
}

/// Flush ('H').
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'H', |_| Ok(()))
    }
}

/// Sync ('S'): close the current pipeline, eliciting `ReadyForQuery`.
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'S', |_| Ok(()))
    }
}

/// Simple query ('Q').
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'Q', |b| put_cstr(b, self.query))
    }
}

/// COPY payload chunk ('d').
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'd', |b| {
            b.put_slice(self.data);
            Ok(())
        })
    }
}

/// End of a `COPY IN` stream ('c').
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'c', |_| Ok(()))
    }
}

/// Abort a `COPY IN` stream ('f').
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub message: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'f', |b| put_cstr(b, self.message))
    }
}

/// Terminate ('X'): graceful goodbye.
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        frame(buf, b'X', |_| Ok(()))
    }
}

// ============================================================================
// Backend (server -> client) messages
// ============================================================================

/// Column description within a `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Authentication request variants carried by an 'R' message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    KerberosV5,
    Gss,
    Sspi,
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
}

/// A decoded backend message.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    BindComplete,
    CloseComplete,
    CommandComplete {
        tag: String,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    DataRow {
        columns: Vec<Option<Bytes>>,
    },
    EmptyQueryResponse,
    ErrorResponse {
        error: ServerError,
    },
    NegotiateProtocolVersion {
        newest_minor: i32,
        unsupported_options: Vec<String>,
    },
    NoData,
    NoticeResponse {
        notice: ServerError,
    },
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        param_types: Vec<Oid>,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ParseComplete,
    PortalSuspended,
    ReadyForQuery {
        status: TransactionStatus,
    },
    RowDescription {
        fields: Vec<FieldDescription>,
    },
}

impl BackendMessage {
    /// Decode a message body given its tag byte.
    pub fn decode(tag: u8, body: Bytes) -> Result<Self> {
        match tag {
            b'R' => Self::decode_auth(body),
            b'K' => Self::decode_backend_key_data(body),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'C' => Self::decode_command_complete(body),
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            b'G' => Ok(BackendMessage::CopyInResponse),
            b'H' => Ok(BackendMessage::CopyOutResponse),
            b'W' => Ok(BackendMessage::CopyBothResponse),
            b'D' => Self::decode_data_row(body),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'E' => Ok(BackendMessage::ErrorResponse {
                error: ServerError::from_fields(read_error_fields(body)?),
            }),
            b'v' => Self::decode_negotiate_version(body),
            b'n' => Ok(BackendMessage::NoData),
            b'N' => Ok(BackendMessage::NoticeResponse {
                notice: ServerError::from_fields(read_error_fields(body)?),
            }),
            b'A' => Self::decode_notification(body),
            b't' => Self::decode_parameter_description(body),
            b'S' => Self::decode_parameter_status(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b's' => Ok(BackendMessage::PortalSuspended),
            b'Z' => Self::decode_ready_for_query(body),
            b'T' => Self::decode_row_description(body),
            other => Err(Error::protocol(format!(
                "unknown message type {:?}",
                other as char
            ))),
        }
    }

    /// Decode a complete frame (header plus body). Test helper mirroring the
    /// reader task's framing.
    pub fn decode_frame(buf: &mut Bytes) -> Result<Self> {
        need(buf, Header::SIZE, "message header")?;
        let header = Header::parse(&buf[..Header::SIZE])?;
        buf.advance(Header::SIZE);
        need(buf, header.body_len(), "message body")?;
        let body = buf.split_to(header.body_len());
        Self::decode(header.tag, body)
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        need(&body, 4, "authentication status")?;
        let status = body.get_i32();
        let auth = match status {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                need(&body, 4, "md5 salt")?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body[..4]);
                Authentication::Md5Password { salt }
            }
            7 => Authentication::Gss,
            9 => Authentication::Sspi,
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 && body[0] != 0 {
                    mechanisms.push(get_cstr(&mut body)?);
                }
                Authentication::Sasl { mechanisms }
            }
            11 => Authentication::SaslContinue { data: body },
            12 => Authentication::SaslFinal { data: body },
            other => {
                return Err(Error::protocol(format!(
                    "unknown authentication status {other}"
                )))
            }
        };
        Ok(BackendMessage::Authentication(auth))
    }

    fn decode_backend_key_data(mut body: Bytes) -> Result<Self> {
        need(&body, 8, "backend key data")?;
        Ok(BackendMessage::BackendKeyData {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }

    fn decode_command_complete(mut body: Bytes) -> Result<Self> {
        Ok(BackendMessage::CommandComplete {
            tag: get_cstr(&mut body)?,
        })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        need(&body, 2, "data row column count")?;
        let count = body.get_i16() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(get_bytes_lp(&mut body)?);
        }
        Ok(BackendMessage::DataRow { columns })
    }

    fn decode_negotiate_version(mut body: Bytes) -> Result<Self> {
        need(&body, 8, "protocol negotiation")?;
        let newest_minor = body.get_i32();
        let count = body.get_i32() as usize;
        let mut unsupported_options = Vec::with_capacity(count);
        for _ in 0..count {
            unsupported_options.push(get_cstr(&mut body)?);
        }
        Ok(BackendMessage::NegotiateProtocolVersion {
            newest_minor,
            unsupported_options,
        })
    }

    fn decode_notification(mut body: Bytes) -> Result<Self> {
        need(&body, 4, "notification pid")?;
        Ok(BackendMessage::NotificationResponse {
            process_id: body.get_i32(),
            channel: get_cstr(&mut body)?,
            payload: get_cstr(&mut body)?,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        need(&body, 2, "parameter count")?;
        let count = body.get_i16() as usize;
        let mut param_types = Vec::with_capacity(count);
        for _ in 0..count {
            need(&body, 4, "parameter oid")?;
            param_types.push(Oid::from_i32(body.get_i32()));
        }
        Ok(BackendMessage::ParameterDescription { param_types })
    }

    fn decode_parameter_status(mut body: Bytes) -> Result<Self> {
        Ok(BackendMessage::ParameterStatus {
            name: get_cstr(&mut body)?,
            value: get_cstr(&mut body)?,
        })
    }

    fn decode_ready_for_query(mut body: Bytes) -> Result<Self> {
        need(&body, 1, "transaction status")?;
        Ok(BackendMessage::ReadyForQuery {
            status: TransactionStatus::from(body.get_u8()),
        })
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        need(&body, 2, "field count")?;
        let count = body.get_i16() as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = get_cstr(&mut body)?;
            need(&body, 18, "field description")?;
            fields.push(FieldDescription {
                name,
                table_oid: body.get_i32(),
                column_attr: body.get_i16(),
                type_oid: Oid::from_i32(body.get_i32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: body.get_i16(),
            });
        }
        Ok(BackendMessage::RowDescription { fields })
    }
}

/// Read the letter-tagged field list of an error or notice, terminated by a
/// zero byte.
fn read_error_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.remaining() > 0 {
        let tag = body.get_u8();
        if tag == 0 {
            break;
        }
        fields.insert(tag, get_cstr(&mut body)?);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_message_backfills_length() {
        let msg = StartupMessage {
            params: vec![
                ("user".to_string(), "test".to_string()),
                ("database".to_string(), "testdb".to_string()),
            ],
        };
        let encoded = encode_frame(&msg).unwrap();

        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());

        let version = i32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(encoded[encoded.len() - 1], 0);
    }

    #[test]
    fn cancel_request_layout() {
        let msg = CancelRequest {
            process_id: 7,
            secret_key: 42,
        };
        let encoded = encode_frame(&msg).unwrap();
        assert_eq!(encoded.len(), 16);
        let code = i32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(code, CANCEL_REQUEST_CODE);
    }

    #[test]
    fn query_message_layout() {
        let msg = QueryMessage { query: "SELECT 1" };
        let encoded = encode_frame(&msg).unwrap();

        assert_eq!(encoded[0], b'Q');
        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len, 13);
        assert_eq!(&encoded[5..], b"SELECT 1\0");
    }

    #[test]
    fn bind_message_text_format() {
        let params = vec![Some("42".to_string()), None];
        let msg = BindMessage {
            portal: "__st0_0",
            statement: "__st0",
            params: &params,
        };
        let encoded = encode_frame(&msg).unwrap();

        let mut expected = BytesMut::new();
        expected.put_u8(b'B');
        expected.put_i32(4 + 8 + 6 + 2 + 2 + 4 + 2 + 4 + 2);
        expected.put_slice(b"__st0_0\0");
        expected.put_slice(b"__st0\0");
        expected.put_i16(0);
        expected.put_i16(2);
        expected.put_i32(2);
        expected.put_slice(b"42");
        expected.put_i32(-1);
        expected.put_i16(0);

        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn execute_and_close_layout() {
        let encoded = encode_frame(&ExecuteMessage {
            portal: "p",
            row_limit: 5,
        })
        .unwrap();
        assert_eq!(encoded[0], b'E');
        assert_eq!(&encoded[5..7], b"p\0");
        assert_eq!(
            i32::from_be_bytes([encoded[7], encoded[8], encoded[9], encoded[10]]),
            5
        );

        let encoded = encode_frame(&CloseMessage { kind: b'P', name: "p" }).unwrap();
        assert_eq!(encoded[0], b'C');
        assert_eq!(encoded[5], b'P');
    }

    #[test]
    fn sync_flush_terminate_are_empty_frames() {
        for (bytes, tag) in [
            (encode_frame(&SyncMessage).unwrap(), b'S'),
            (encode_frame(&FlushMessage).unwrap(), b'H'),
            (encode_frame(&TerminateMessage).unwrap(), b'X'),
            (encode_frame(&CopyDoneMessage).unwrap(), b'c'),
        ] {
            assert_eq!(bytes.len(), 5);
            assert_eq!(bytes[0], tag);
            let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            assert_eq!(len, 4);
        }
    }

    #[test]
    fn cstr_rejects_embedded_nul() {
        let err = encode_frame(&QueryMessage {
            query: "SELECT\0 1",
        })
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn decode_authentication_variants() {
        let data: &[u8] = &[b'R', 0, 0, 0, 8, 0, 0, 0, 0];
        let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(data)).unwrap();
        assert!(matches!(
            msg,
            BackendMessage::Authentication(Authentication::Ok)
        ));

        let mut data = vec![b'R'];
        let body = b"\x00\x00\x00\x0aSCRAM-SHA-256\0\0";
        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(body);
        let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(&data)).unwrap();
        match msg {
            BackendMessage::Authentication(Authentication::Sasl { mechanisms }) => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_ready_for_query_statuses() {
        for (byte, status) in [
            (b'I', TransactionStatus::Idle),
            (b'T', TransactionStatus::InTransaction),
            (b'E', TransactionStatus::Failed),
        ] {
            let data = [b'Z', 0, 0, 0, 5, byte];
            let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(&data)).unwrap();
            match msg {
                BackendMessage::ReadyForQuery { status: got } => assert_eq!(got, status),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn decode_data_row_with_null() {
        let mut data = vec![b'D'];
        let mut body = BytesMut::new();
        body.put_i16(2);
        body.put_i32(5);
        body.put_slice(b"hello");
        body.put_i32(-1);
        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(&data)).unwrap();
        match msg {
            BackendMessage::DataRow { columns } => {
                assert_eq!(columns.len(), 2);
                assert_eq!(columns[0].as_deref(), Some(&b"hello"[..]));
                assert_eq!(columns[1], None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_row_description() {
        let mut data = vec![b'T'];
        let mut body = BytesMut::new();
        body.put_i16(1);
        body.put_slice(b"id\0");
        body.put_i32(0);
        body.put_i16(0);
        body.put_i32(23);
        body.put_i16(4);
        body.put_i32(-1);
        body.put_i16(0);
        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(&data)).unwrap();
        match msg {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, Oid::INT4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_error_response_defaults() {
        let mut data = vec![b'E'];
        let body = b"Mboom\0\0";
        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(body);

        let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(&data)).unwrap();
        match msg {
            BackendMessage::ErrorResponse { error } => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.code, "XX000");
                assert_eq!(error.severity, "ERROR");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_error_response_full_fields() {
        let mut data = vec![b'E'];
        let body =
            b"SERROR\0VERROR\0C42P01\0Mrelation \"foo\" does not exist\0L123\0Rparse\0\0";
        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(body);

        let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(&data)).unwrap();
        match msg {
            BackendMessage::ErrorResponse { error } => {
                assert_eq!(error.code, "42P01");
                assert_eq!(error.line, Some(123));
                assert_eq!(error.routine.as_deref(), Some("parse"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_notification() {
        let mut data = vec![b'A'];
        let mut body = BytesMut::new();
        body.put_i32(1234);
        body.put_slice(b"updates\0payload\0");
        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode_frame(&mut Bytes::copy_from_slice(&data)).unwrap();
        match msg {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                assert_eq!(process_id, 1234);
                assert_eq!(channel, "updates");
                assert_eq!(payload, "payload");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn header_rejects_short_length() {
        let err = Header::parse(&[b'Z', 0, 0, 0, 3]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
