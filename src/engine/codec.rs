//! QAP1 wire format: frames, data items, and expression encoding.
//!
//! Everything here is a pure function over byte buffers so the format can
//! be tested without a server. The QAP1 layout (Rserve protocol 0103):
//!
//! - A message is a 16-byte little-endian header (command word, body
//!   length, data offset, high length bits) followed by the body.
//! - The body is a sequence of data items, each with a 4-byte header: a
//!   type byte and a 24-bit little-endian length.
//! - Expressions (SEXPs) use the same item header shape with their own
//!   type space; vectors of doubles and strings are the only kinds this
//!   client sends.
//!
//! Responses echo the command word with [`CMD_RESP`] set; errors carry a
//! status code in the top byte, mapped to
//! [`ServerStatus`](crate::error::ServerStatus).

use bytes::{Buf, BufMut, Bytes};
use num_traits::FromPrimitive;

use crate::engine::RValue;
use crate::error::{Error, Result, ServerStatus};

// Command words.
pub const CMD_LOGIN: u32 = 0x001;
pub const CMD_VOID_EVAL: u32 = 0x002;
pub const CMD_EVAL: u32 = 0x003;
pub const CMD_SHUTDOWN: u32 = 0x004;
pub const CMD_ASSIGN_SEXP: u32 = 0x021;

/// Bit set on every response command word.
pub const CMD_RESP: u32 = 0x10000;
/// Response command word for success.
pub const RESP_OK: u32 = CMD_RESP | 0x0001;
/// Response command word for failure; status code in the top byte.
pub const RESP_ERR: u32 = CMD_RESP | 0x0002;

// Data item types.
pub const DT_STRING: u8 = 4;
pub const DT_SEXP: u8 = 10;

// Expression types.
pub const XT_NULL: u8 = 0;
pub const XT_INT: u8 = 1;
pub const XT_DOUBLE: u8 = 2;
pub const XT_STR: u8 = 3;
pub const XT_ARRAY_INT: u8 = 32;
pub const XT_ARRAY_DOUBLE: u8 = 33;
pub const XT_ARRAY_STR: u8 = 34;
/// Flag on the expression type byte: an attribute expression precedes the
/// content.
pub const XT_HAS_ATTR: u8 = 0x80;

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 16;

/// Item payloads carry a 24-bit length.
const MAX_ITEM_SIZE: usize = 0xff_ffff;

fn put_item_header(buf: &mut Vec<u8>, ty: u8, len: usize) -> Result<()> {
    if len > MAX_ITEM_SIZE {
        return Err(Error::InvalidArgument(format!(
            "value of {} bytes exceeds the {} byte item limit",
            len, MAX_ITEM_SIZE
        )));
    }
    buf.put_u8(ty);
    buf.put_u8((len & 0xff) as u8);
    buf.put_u8(((len >> 8) & 0xff) as u8);
    buf.put_u8(((len >> 16) & 0xff) as u8);
    Ok(())
}

fn read_item_header(buf: &mut Bytes) -> Option<(u8, usize)> {
    if buf.remaining() < 4 {
        return None;
    }
    let ty = buf.get_u8();
    let len =
        buf.get_u8() as usize | (buf.get_u8() as usize) << 8 | (buf.get_u8() as usize) << 16;
    Some((ty, len))
}

/// Frame a complete message: header plus body.
pub fn encode_frame(cmd: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.put_u32_le(cmd);
    frame.put_u32_le(body.len() as u32);
    frame.put_u32_le(0); // data offset
    frame.put_u32_le(0); // high length bits; bodies here never reach 4 GiB
    frame.extend_from_slice(body);
    frame
}

/// Split a message header into the command word and body length.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> (u32, usize) {
    let mut buf = &header[..];
    let cmd = buf.get_u32_le();
    let len = buf.get_u32_le() as u64;
    buf.advance(4); // data offset
    let len_high = buf.get_u32_le() as u64;
    (cmd, (len | len_high << 32) as usize)
}

/// Inspect a response command word.
///
/// # Errors
/// [`Error::Server`] with the reported status, or [`Error::Eval`] for a
/// code outside the known status space.
pub fn check_response(cmd: u32) -> Result<()> {
    if cmd & CMD_RESP == 0 {
        return Err(Error::Eval(format!(
            "unexpected message from server: {:#x}",
            cmd
        )));
    }
    if cmd & 0xff == (RESP_OK & 0xff) {
        return Ok(());
    }
    let code = (cmd >> 24) & 0x7f;
    match ServerStatus::from_u32(code) {
        Some(status) => Err(Error::Server(status)),
        None => Err(Error::Eval(format!("server error code {:#x}", code))),
    }
}

/// Encode a `DT_STRING` item: NUL-terminated, NUL-padded to a 4-byte
/// boundary.
pub fn encode_string_item(s: &str) -> Result<Vec<u8>> {
    let terminated = s.len() + 1;
    let padded = terminated.div_ceil(4) * 4;
    let mut buf = Vec::with_capacity(4 + padded);
    put_item_header(&mut buf, DT_STRING, padded)?;
    buf.extend_from_slice(s.as_bytes());
    buf.resize(4 + padded, 0);
    Ok(buf)
}

/// Encode the login payload: `user\npassword` as a single string item.
pub fn encode_login(username: &str, password: &str) -> Result<Vec<u8>> {
    encode_string_item(&format!("{}\n{}", username, password))
}

/// Encode a value as a SEXP (expression header plus content).
pub fn encode_sexp(value: &RValue) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    let xt = match value {
        RValue::Num(n) => {
            content.put_f64_le(*n);
            XT_ARRAY_DOUBLE
        }
        RValue::Nums(v) => {
            for n in v {
                content.put_f64_le(*n);
            }
            XT_ARRAY_DOUBLE
        }
        RValue::Str(s) => {
            content.extend_from_slice(s.as_bytes());
            content.put_u8(0);
            pad_string_array(&mut content);
            XT_ARRAY_STR
        }
        RValue::Strings(v) => {
            for s in v {
                content.extend_from_slice(s.as_bytes());
                content.put_u8(0);
            }
            pad_string_array(&mut content);
            XT_ARRAY_STR
        }
    };
    let mut buf = Vec::with_capacity(4 + content.len());
    put_item_header(&mut buf, xt, content.len())?;
    buf.extend_from_slice(&content);
    Ok(buf)
}

// String arrays are padded to a 4-byte boundary with 0x01 bytes so the
// padding cannot be mistaken for an empty trailing element.
fn pad_string_array(content: &mut Vec<u8>) {
    while content.len() % 4 != 0 {
        content.push(0x01);
    }
}

/// Encode the body of an assignment: symbol name plus value expression.
pub fn encode_assign(name: &str, value: &RValue) -> Result<Vec<u8>> {
    let mut body = encode_string_item(name)?;
    let sexp = encode_sexp(value)?;
    let mut item = Vec::with_capacity(4 + sexp.len());
    put_item_header(&mut item, DT_SEXP, sexp.len())?;
    item.extend_from_slice(&sexp);
    body.extend_from_slice(&item);
    Ok(body)
}

/// Extract the value from a response body, if it carries one.
///
/// Walks the data items and decodes the first SEXP found. Void responses
/// yield `None`.
pub fn parse_response_body(body: Bytes) -> Result<Option<RValue>> {
    let mut buf = body;
    while let Some((ty, len)) = read_item_header(&mut buf) {
        if buf.remaining() < len {
            return Err(Error::Eval(format!(
                "truncated response: item of {} bytes with {} remaining",
                len,
                buf.remaining()
            )));
        }
        let content = buf.split_to(len);
        if ty & 0x3f == DT_SEXP {
            return parse_sexp(content).map(Some);
        }
    }
    Ok(None)
}

/// Decode a SEXP into an [`RValue`].
pub fn parse_sexp(sexp: Bytes) -> Result<RValue> {
    let mut buf = sexp;
    let (ty, len) = read_item_header(&mut buf)
        .ok_or_else(|| Error::Eval("truncated expression header".to_string()))?;
    if buf.remaining() < len {
        return Err(Error::Eval(format!(
            "truncated expression: {} bytes declared, {} present",
            len,
            buf.remaining()
        )));
    }
    let mut content = buf.split_to(len);

    let base = ty & !XT_HAS_ATTR;
    if ty & XT_HAS_ATTR != 0 {
        // Skip the attribute expression that precedes the content.
        let (_, attr_len) = read_item_header(&mut content)
            .ok_or_else(|| Error::Eval("truncated attribute header".to_string()))?;
        if content.remaining() < attr_len {
            return Err(Error::Eval("truncated attribute expression".to_string()));
        }
        content.advance(attr_len);
    }

    match base {
        XT_ARRAY_DOUBLE => {
            let mut values = Vec::with_capacity(content.remaining() / 8);
            while content.remaining() >= 8 {
                values.push(content.get_f64_le());
            }
            Ok(RValue::Nums(values))
        }
        XT_DOUBLE => {
            if content.remaining() < 8 {
                return Err(Error::Eval("truncated double".to_string()));
            }
            Ok(RValue::Num(content.get_f64_le()))
        }
        XT_ARRAY_INT => {
            let mut values = Vec::with_capacity(content.remaining() / 4);
            while content.remaining() >= 4 {
                values.push(content.get_i32_le() as f64);
            }
            Ok(RValue::Nums(values))
        }
        XT_INT => {
            if content.remaining() < 4 {
                return Err(Error::Eval("truncated integer".to_string()));
            }
            Ok(RValue::Num(content.get_i32_le() as f64))
        }
        XT_ARRAY_STR => Ok(RValue::Strings(split_string_array(&content))),
        XT_STR => {
            let strings = split_string_array(&content);
            match strings.into_iter().next() {
                Some(s) => Ok(RValue::Str(s)),
                None => Ok(RValue::Str(String::new())),
            }
        }
        XT_NULL => Err(Error::Eval("expression evaluated to NULL".to_string())),
        other => Err(Error::Eval(format!(
            "unsupported expression type {:#x}",
            other
        ))),
    }
}

// Split NUL-terminated strings out of an XT_ARRAY_STR payload, ignoring
// the 0x01 padding after the final terminator.
fn split_string_array(content: &Bytes) -> Vec<String> {
    let mut strings = Vec::new();
    let mut start = 0;
    for (i, b) in content.iter().enumerate() {
        if *b == 0 {
            strings.push(String::from_utf8_lossy(&content[start..i]).into_owned());
            start = i + 1;
        }
    }
    strings
}
