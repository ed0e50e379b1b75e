use super::messages::*;
use crate::connection::{FieldDescription, TransactionStatus};
use crate::core::{ProxyError, Result, ShardError};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest accepted startup packet, length word included
pub const MAX_STARTUP_LENGTH: usize = 10_000;
/// Largest accepted regular message, length word included
pub const MAX_MESSAGE_LENGTH: usize = 1 << 30;

/// Frames the v3 protocol on a client socket
///
/// Starts in the startup phase, where packets carry no tag, and switches to
/// tagged messages once a protocol 3.0 StartupMessage has been decoded.
#[derive(Debug)]
pub struct PgCodec {
    startup: bool,
}

impl PgCodec {
    pub fn new() -> Self {
        Self { startup: true }
    }

    pub fn in_startup(&self) -> bool {
        self.startup
    }

    fn decode_startup(&mut self, src: &mut BytesMut) -> Result<Option<FrontendMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let len = usize::try_from(len)
            .ok()
            .filter(|len| (8..=MAX_STARTUP_LENGTH).contains(len))
            .ok_or_else(|| ProxyError::Protocol(format!("invalid startup packet length {}", len)))?;

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(len);
        body.advance(4);
        let code = body.get_i32();

        let message = match code {
            SSL_REQUEST_CODE => FrontendMessage::SslRequest,
            GSSENC_REQUEST_CODE => FrontendMessage::GssEncRequest,
            CANCEL_REQUEST_CODE => {
                if body.remaining() < 8 {
                    return Err(ProxyError::Protocol("truncated cancel request".into()));
                }
                FrontendMessage::CancelRequest {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                }
            }
            PROTOCOL_VERSION_3 => {
                let params = read_startup_params(&mut body)?;
                self.startup = false;
                FrontendMessage::Startup {
                    version: code,
                    params,
                }
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unsupported frontend protocol {}.{}",
                    other >> 16,
                    other & 0xffff
                )));
            }
        };
        Ok(Some(message))
    }

    fn decode_regular(&mut self, src: &mut BytesMut) -> Result<Option<FrontendMessage>> {
        if src.len() < 5 {
            return Ok(None);
        }
        let tag = src[0];
        let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        let len = usize::try_from(len)
            .ok()
            .filter(|len| (4..=MAX_MESSAGE_LENGTH).contains(len))
            .ok_or_else(|| {
                ProxyError::Protocol(format!(
                    "invalid length {} for message '{}'",
                    len,
                    char::from(tag)
                ))
            })?;

        if src.len() < len + 1 {
            src.reserve(len + 1 - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(len + 1);
        body.advance(5);

        let message = match tag {
            b'Q' => FrontendMessage::Query(read_cstring(&mut body)?),
            b'X' => FrontendMessage::Terminate,
            b'S' => FrontendMessage::Sync,
            other => FrontendMessage::Other(other),
        };
        Ok(Some(message))
    }
}

impl Default for PgCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PgCodec {
    type Item = FrontendMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.startup {
            self.decode_startup(src)
        } else {
            self.decode_regular(src)
        }
    }
}

impl Encoder<BackendMessage> for PgCodec {
    type Error = ProxyError;

    fn encode(&mut self, message: BackendMessage, dst: &mut BytesMut) -> Result<()> {
        match message {
            BackendMessage::SslDeny => dst.put_u8(b'N'),
            BackendMessage::AuthenticationOk => write_frame(dst, b'R', |buf| buf.put_i32(0)),
            BackendMessage::ParameterStatus { name, value } => write_frame(dst, b'S', |buf| {
                put_cstring(buf, &name);
                put_cstring(buf, &value);
            }),
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => write_frame(dst, b'K', |buf| {
                buf.put_i32(process_id);
                buf.put_i32(secret_key);
            }),
            BackendMessage::ReadyForQuery(status) => {
                write_frame(dst, b'Z', |buf| buf.put_u8(status_indicator(status)))
            }
            BackendMessage::RowDescription(fields) => {
                let count = field_count(fields.len())?;
                write_frame(dst, b'T', |buf| {
                    buf.put_i16(count);
                    for field in &fields {
                        put_field(buf, field);
                    }
                })
            }
            BackendMessage::DataRow(values) => {
                let count = field_count(values.len())?;
                write_frame(dst, b'D', |buf| {
                    buf.put_i16(count);
                    for value in &values {
                        match value {
                            Some(text) => {
                                buf.put_i32(text.len() as i32);
                                buf.put_slice(text.as_bytes());
                            }
                            None => buf.put_i32(-1),
                        }
                    }
                })
            }
            BackendMessage::CommandComplete(tag) => {
                write_frame(dst, b'C', |buf| put_cstring(buf, &tag))
            }
            BackendMessage::EmptyQueryResponse => write_frame(dst, b'I', |_| {}),
            BackendMessage::ErrorResponse(fields) => {
                write_frame(dst, b'E', |buf| put_error_fields(buf, &fields))
            }
        }
        Ok(())
    }
}

fn write_frame<F>(dst: &mut BytesMut, tag: u8, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    dst.put_u8(tag);
    let len_at = dst.len();
    dst.put_i32(0);
    body(dst);
    let len = (dst.len() - len_at) as i32;
    dst[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn field_count(count: usize) -> Result<i16> {
    i16::try_from(count)
        .map_err(|_| ProxyError::Protocol(format!("too many columns in one row: {}", count)))
}

fn status_indicator(status: TransactionStatus) -> u8 {
    match status {
        TransactionStatus::Idle => b'I',
        TransactionStatus::InTransaction => b'T',
        TransactionStatus::Failed => b'E',
    }
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_field(buf: &mut BytesMut, field: &FieldDescription) {
    put_cstring(buf, &field.name);
    buf.put_u32(field.table_oid);
    buf.put_i16(field.column_id);
    buf.put_u32(field.type_oid);
    buf.put_i16(field.type_size);
    buf.put_i32(field.type_modifier);
    buf.put_i16(field.format);
}

fn put_error_fields(buf: &mut BytesMut, err: &ShardError) {
    let mut put = |code: u8, value: &str| {
        buf.put_u8(code);
        put_cstring(buf, value);
    };

    put(b'S', &err.severity);
    put(b'V', &err.severity);
    put(b'C', &err.code);
    put(b'M', &err.message);

    let optional = [
        (b'D', err.detail.clone()),
        (b'H', err.hint.clone()),
        (b'P', err.position.map(|p| p.to_string())),
        (b'p', err.internal_position.map(|p| p.to_string())),
        (b'q', err.internal_query.clone()),
        (b'W', err.where_.clone()),
        (b's', err.schema.clone()),
        (b't', err.table.clone()),
        (b'c', err.column.clone()),
        (b'd', err.data_type.clone()),
        (b'n', err.constraint.clone()),
        (b'F', err.file.clone()),
        (b'L', err.line.map(|l| l.to_string())),
        (b'R', err.routine.clone()),
    ];
    for (code, value) in optional {
        if let Some(value) = value {
            put(code, &value);
        }
    }

    buf.put_u8(0);
}

fn read_cstring(buf: &mut BytesMut) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Protocol("missing string terminator".into()))?;
    let bytes = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProxyError::Protocol("invalid UTF-8 in message".into()))
}

fn read_startup_params(body: &mut BytesMut) -> Result<Vec<(String, String)>> {
    let mut params = Vec::new();
    loop {
        if body.is_empty() || body[0] == 0 {
            return Ok(params);
        }
        let key = read_cstring(body)?;
        let value = read_cstring(body)?;
        params.push((key, value));
    }
}
