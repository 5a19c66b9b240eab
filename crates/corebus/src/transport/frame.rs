// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix frame codec for stream transports.
//!
//! Stream sockets have no message boundaries, so each message travels as:
//!
//! ```text
//! +----------------+---------------------+
//! | Length (4B LE) | Encoded message     |
//! +----------------+---------------------+
//! ```
//!
//! This codec is the seam where the wire-marshalling collaborator plugs in;
//! the encoding here is a compact little-endian stand-in, not the reference
//! marshalling. What matters to the engine is that encoding is deterministic
//! (partial writes resume byte-exact) and decoding is incremental (a reader
//! either yields a whole message or remembers where it stopped).

use std::io::{self, Read};

use crate::config::MESSAGE_SIZE_MAX;
use crate::message::{BusError, Message, MessageFlags, MessageType, Value};

/// Frame header size: the 4-byte length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

const DEPTH_MAX: usize = 64;

// ============================================================================
// Encoding
// ============================================================================

/// Encode `message` into a framed byte vector (prefix included).
pub fn encode(message: &Message) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);

    payload.push(message.message_type().to_wire());
    payload.push(message.flags().bits());
    payload.push(message.version());
    payload.push(0); // reserved
    payload.extend_from_slice(&message.serial().to_le_bytes());
    payload.extend_from_slice(&message.reply_serial().to_le_bytes());
    payload.extend_from_slice(&message.fd_count().to_le_bytes());

    put_opt_str(&mut payload, message.path());
    put_opt_str(&mut payload, message.interface());
    put_opt_str(&mut payload, message.member());
    put_opt_str(&mut payload, message.destination());
    put_opt_str(&mut payload, message.sender());
    match message.error() {
        Some(e) => {
            payload.push(1);
            put_str(&mut payload, &e.name);
            put_str(&mut payload, &e.message);
        }
        None => payload.push(0),
    }

    put_u32(&mut payload, message.body().len() as u32);
    for v in message.body() {
        put_value(&mut payload, v);
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.push(1);
            put_str(buf, s);
        }
        None => buf.push(0),
    }
}

fn put_value(buf: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Byte(b) => {
            buf.push(1);
            buf.push(*b);
        }
        Value::Bool(b) => {
            buf.push(2);
            buf.push(u8::from(*b));
        }
        Value::I16(n) => {
            buf.push(3);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::U16(n) => {
            buf.push(4);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::I32(n) => {
            buf.push(5);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::U32(n) => {
            buf.push(6);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::I64(n) => {
            buf.push(7);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::U64(n) => {
            buf.push(8);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Double(d) => {
            buf.push(9);
            buf.extend_from_slice(&d.to_le_bytes());
        }
        Value::Str(s) => {
            buf.push(10);
            put_str(buf, s);
        }
        Value::ObjectPath(s) => {
            buf.push(11);
            put_str(buf, s);
        }
        Value::Signature(s) => {
            buf.push(12);
            put_str(buf, s);
        }
        Value::UnixFd(n) => {
            buf.push(13);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Variant(inner) => {
            buf.push(14);
            put_value(buf, inner);
        }
        Value::Array { element, items } => {
            buf.push(15);
            put_str(buf, element);
            put_u32(buf, items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        Value::Struct(fields) => {
            buf.push(16);
            put_u32(buf, fields.len() as u32);
            for field in fields {
                put_value(buf, field);
            }
        }
        Value::DictEntry(k, val) => {
            buf.push(17);
            put_value(buf, k);
            put_value(buf, val);
        }
    }
}

// ============================================================================
// Incremental decoding
// ============================================================================

#[derive(Clone, Copy, Debug)]
enum ReadState {
    /// Accumulating the 4-byte length prefix.
    Length { got: usize },
    /// Accumulating the payload.
    Body { expected: usize, got: usize },
}

/// Incremental frame reader: feed it a non-blocking reader until a whole
/// message falls out.
#[derive(Debug)]
pub struct FrameDecoder {
    state: ReadState,
    buf: Vec<u8>,
    max_size: usize,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder {
            state: ReadState::Length { got: 0 },
            buf: vec![0u8; FRAME_HEADER_SIZE],
            max_size: MESSAGE_SIZE_MAX,
        }
    }

    /// Drop any partial frame state (e.g. after reconnecting).
    pub fn reset(&mut self) {
        self.state = ReadState::Length { got: 0 };
        self.buf = vec![0u8; FRAME_HEADER_SIZE];
    }

    /// Pull bytes from `r` until a message completes or the read would
    /// block. `Ok(None)` means no complete message yet.
    pub fn decode(&mut self, r: &mut dyn Read) -> io::Result<Option<Message>> {
        loop {
            match self.state {
                ReadState::Length { got } => {
                    if !self.fill(r, got, FRAME_HEADER_SIZE)? {
                        return Ok(None);
                    }

                    let expected = u32::from_le_bytes([
                        self.buf[0],
                        self.buf[1],
                        self.buf[2],
                        self.buf[3],
                    ]) as usize;
                    if expected == 0 || expected > self.max_size {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame length {} out of bounds", expected),
                        ));
                    }

                    self.buf = vec![0u8; expected];
                    self.state = ReadState::Body { expected, got: 0 };
                }

                ReadState::Body { expected, got } => {
                    if !self.fill(r, got, expected)? {
                        return Ok(None);
                    }

                    let message = parse_payload(&self.buf)?;
                    self.reset();
                    return Ok(Some(message));
                }
            }
        }
    }

    /// Read toward `want` bytes into the buffer starting at `got`. Returns
    /// `false` when the underlying read would block, parking the progress
    /// made so far for the next readiness cycle.
    fn fill(&mut self, r: &mut dyn Read, mut got: usize, want: usize) -> io::Result<bool> {
        while got < want {
            match r.read(&mut self.buf[got..want]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the stream",
                    ))
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match &mut self.state {
                        ReadState::Length { got: g } | ReadState::Body { got: g, .. } => *g = got,
                    }
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new()
    }
}

// ============================================================================
// Payload parsing
// ============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

fn bad(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed frame: {}", what))
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| bad("overflow"))?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| bad("truncated"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> io::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> io::Result<u64> {
        let b = self.take(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(u64::from_le_bytes(out))
    }

    fn str(&mut self) -> io::Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| bad("non-UTF-8 string"))
    }

    fn opt_str(&mut self) -> io::Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.str()?)),
            _ => Err(bad("bad option tag")),
        }
    }

    fn value(&mut self, depth: usize) -> io::Result<Value> {
        if depth > DEPTH_MAX {
            return Err(bad("value nesting too deep"));
        }

        Ok(match self.u8()? {
            1 => Value::Byte(self.u8()?),
            2 => Value::Bool(self.u8()? != 0),
            3 => Value::I16(self.u16()? as i16),
            4 => Value::U16(self.u16()?),
            5 => Value::I32(self.u32()? as i32),
            6 => Value::U32(self.u32()?),
            7 => Value::I64(self.u64()? as i64),
            8 => Value::U64(self.u64()?),
            9 => Value::Double(f64::from_le_bytes({
                let b = self.take(8)?;
                let mut out = [0u8; 8];
                out.copy_from_slice(b);
                out
            })),
            10 => Value::Str(self.str()?),
            11 => Value::ObjectPath(self.str()?),
            12 => Value::Signature(self.str()?),
            13 => Value::UnixFd(self.u32()?),
            14 => Value::Variant(Box::new(self.value(depth + 1)?)),
            15 => {
                let element = self.str()?;
                let count = self.u32()? as usize;
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Value::Array { element, items }
            }
            16 => {
                let count = self.u32()? as usize;
                let mut fields = Vec::new();
                for _ in 0..count {
                    fields.push(self.value(depth + 1)?);
                }
                Value::Struct(fields)
            }
            17 => {
                let k = self.value(depth + 1)?;
                let v = self.value(depth + 1)?;
                Value::DictEntry(Box::new(k), Box::new(v))
            }
            t => return Err(bad(&format!("unknown value tag {}", t))),
        })
    }
}

fn parse_payload(bytes: &[u8]) -> io::Result<Message> {
    let mut r = Reader { bytes, pos: 0 };

    let ty = MessageType::from_wire(r.u8()?).ok_or_else(|| bad("unknown message type"))?;
    let flags = MessageFlags::from_bits(r.u8()?);
    let version = r.u8()?;
    let _reserved = r.u8()?;
    let serial = r.u64()?;
    let reply_serial = r.u64()?;
    let n_fds = r.u32()?;

    let path = r.opt_str()?;
    let interface = r.opt_str()?;
    let member = r.opt_str()?;
    let destination = r.opt_str()?;
    let sender = r.opt_str()?;
    let error = match r.u8()? {
        0 => None,
        1 => Some(BusError::new(r.str()?, r.str()?)),
        _ => return Err(bad("bad error tag")),
    };

    let count = r.u32()? as usize;
    let mut body = Vec::new();
    for _ in 0..count {
        body.push(r.value(0)?);
    }

    if r.pos != bytes.len() {
        return Err(bad("trailing bytes"));
    }

    Ok(Message::from_parts(
        ty,
        flags,
        version,
        serial,
        reply_serial,
        path,
        interface,
        member,
        destination,
        sender,
        error,
        n_fds,
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        block_next: bool,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "later"));
            }
            if self.pos >= self.data.len() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "drained"));
            }
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn sample() -> Message {
        let mut m = Message::method_call(
            Some(":1.7"),
            "/org/example",
            Some("org.example.Iface"),
            "Frob",
        )
        .unwrap();
        m.append(Value::string("hello")).unwrap();
        m.append(Value::U32(42)).unwrap();
        m.append(Value::variant(Value::Struct(vec![
            Value::Bool(true),
            Value::Double(0.5),
        ])))
        .unwrap();
        m.append(Value::property_dict(vec![("P".into(), Value::I64(-9))]))
            .unwrap();
        m.sealed_with(31)
    }

    #[test]
    fn test_round_trip() {
        let m = sample();
        let frame = encode(&m);

        let mut dec = FrameDecoder::new();
        let mut r = Chunked {
            data: frame,
            pos: 0,
            chunk: usize::MAX,
            block_next: false,
        };

        let out = dec.decode(&mut r).unwrap().expect("message");
        assert_eq!(out.message_type(), MessageType::MethodCall);
        assert_eq!(out.serial(), 31);
        assert_eq!(out.path(), Some("/org/example"));
        assert_eq!(out.interface(), Some("org.example.Iface"));
        assert_eq!(out.member(), Some("Frob"));
        assert_eq!(out.destination(), Some(":1.7"));
        assert_eq!(out.body(), m.body());
        assert_eq!(out.signature(), "suva{sv}");
        assert!(out.is_sealed());
    }

    #[test]
    fn test_incremental_decode() {
        let frame = encode(&sample());
        let total = frame.len();

        let mut dec = FrameDecoder::new();
        let mut r = Chunked {
            data: frame,
            pos: 0,
            chunk: 3,
            block_next: false,
        };

        // Every call makes at most 3 bytes of progress; the decoder must
        // stitch them together across WouldBlock boundaries.
        let mut result = None;
        for _ in 0..total * 2 {
            r.block_next = true;
            if let Some(m) = dec.decode(&mut r).unwrap() {
                result = Some(m);
                break;
            }
        }
        assert!(result.is_some());
    }

    #[test]
    fn test_error_round_trip() {
        let call = Message::method_call(None, "/", None, "Ping")
            .unwrap()
            .sealed_with(5);
        let err = Message::method_error(
            &call,
            BusError::new("org.freedesktop.DBus.Error.UnknownMethod", "no Ping here"),
        )
        .unwrap()
        .sealed_with(6);

        let mut dec = FrameDecoder::new();
        let mut r = Chunked {
            data: encode(&err),
            pos: 0,
            chunk: usize::MAX,
            block_next: false,
        };
        let out = dec.decode(&mut r).unwrap().expect("message");
        assert_eq!(out.message_type(), MessageType::MethodError);
        assert_eq!(out.reply_serial(), 5);
        assert_eq!(
            out.error().map(|e| e.name.as_str()),
            Some("org.freedesktop.DBus.Error.UnknownMethod")
        );
    }

    #[test]
    fn test_eof_is_error() {
        let mut dec = FrameDecoder::new();
        let mut r = io::Cursor::new(Vec::<u8>::new());
        let err = dec.decode(&mut r).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut frame = vec![0u8; 4];
        frame.copy_from_slice(&(u32::MAX).to_le_bytes());

        let mut dec = FrameDecoder::new();
        let mut r = Chunked {
            data: frame,
            pos: 0,
            chunk: usize::MAX,
            block_next: false,
        };
        let err = dec.decode(&mut r).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let payload = vec![99u8; 8];
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);

        let mut dec = FrameDecoder::new();
        let mut r = Chunked {
            data: frame,
            pos: 0,
            chunk: usize::MAX,
            block_next: false,
        };
        assert!(dec.decode(&mut r).is_err());
    }
}
