// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed messages exchanged over a bus connection.
//!
//! The wire marshalling itself belongs to the codec collaborator; the engine
//! only sees [`Message`] values: a fixed header (type, flags, serials,
//! addressing fields) plus a typed body of [`Value`]s with a read cursor.
//! Sealing assigns the serial and freezes the body; a message is sealed
//! exactly once.

use std::fmt;
use std::ops::BitOr;

use crate::error::{Error, Result};
use crate::names::{
    interface_name_is_valid, member_name_is_valid, object_path_is_valid, service_name_is_valid,
};

// ============================================================================
// Message type and flags
// ============================================================================

/// The four wire message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A method invocation addressed to an object path.
    MethodCall,
    /// A successful reply to a method call.
    MethodReturn,
    /// An error reply to a method call.
    MethodError,
    /// A broadcast notification.
    Signal,
}

impl MessageType {
    /// Whether this is a reply type (return or error).
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::MethodReturn | MessageType::MethodError)
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::MethodError => 3,
            MessageType::Signal => 4,
        }
    }

    pub(crate) fn from_wire(b: u8) -> Option<MessageType> {
        match b {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::MethodError),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Header flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// The sender does not want a reply; the receiver may suppress one.
    pub const NO_REPLY_EXPECTED: MessageFlags = MessageFlags(0x1);
    /// Do not launch an owner for the destination name.
    pub const NO_AUTO_START: MessageFlags = MessageFlags(0x2);

    /// No flags set.
    pub fn empty() -> MessageFlags {
        MessageFlags(0)
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: MessageFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn from_bits(bits: u8) -> MessageFlags {
        MessageFlags(bits)
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

// ============================================================================
// Errors on the wire
// ============================================================================

/// A named error as carried in method-error messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusError {
    /// Error name in interface-name form, e.g.
    /// `org.freedesktop.DBus.Error.UnknownMethod`.
    pub name: String,
    /// Human-readable detail.
    pub message: String,
}

impl BusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> BusError {
        BusError {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

// ============================================================================
// Body values
// ============================================================================

/// A single typed body value.
///
/// Containers carry enough type information to render their signature even
/// when empty: arrays store their element signature explicitly.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(u32),
    Variant(Box<Value>),
    Array {
        /// Signature of one element.
        element: String,
        items: Vec<Value>,
    },
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Convenience constructor for object-path values.
    pub fn object_path(s: impl Into<String>) -> Value {
        Value::ObjectPath(s.into())
    }

    /// Wrap a value in a variant.
    pub fn variant(v: Value) -> Value {
        Value::Variant(Box::new(v))
    }

    /// An `a{sv}` dictionary from (name, value) pairs.
    pub fn property_dict(entries: Vec<(String, Value)>) -> Value {
        Value::Array {
            element: "{sv}".into(),
            items: entries
                .into_iter()
                .map(|(k, v)| Value::DictEntry(Box::new(Value::Str(k)), Box::new(Value::variant(v))))
                .collect(),
        }
    }

    /// Render this value's type signature.
    pub fn signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".into(),
            Value::Bool(_) => "b".into(),
            Value::I16(_) => "n".into(),
            Value::U16(_) => "q".into(),
            Value::I32(_) => "i".into(),
            Value::U32(_) => "u".into(),
            Value::I64(_) => "x".into(),
            Value::U64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::Str(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::UnixFd(_) => "h".into(),
            Value::Variant(_) => "v".into(),
            Value::Array { element, .. } => format!("a{}", element),
            Value::Struct(fields) => {
                let mut s = String::from("(");
                for f in fields {
                    s.push_str(&f.signature());
                }
                s.push(')');
                s
            }
            Value::DictEntry(k, v) => format!("{{{}{}}}", k.signature(), v.signature()),
        }
    }

    /// Borrow the inner string of `Str`, `ObjectPath` or `Signature` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// One bus message: header fields plus a typed body.
#[derive(Clone, Debug)]
pub struct Message {
    ty: MessageType,
    flags: MessageFlags,
    version: u8,
    serial: u64,
    reply_serial: u64,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    error: Option<BusError>,
    body: Vec<Value>,
    rpos: usize,
    n_fds: u32,
    sealed: bool,
    dont_send: bool,
}

impl Message {
    fn blank(ty: MessageType) -> Message {
        Message {
            ty,
            flags: MessageFlags::empty(),
            version: crate::config::MESSAGE_VERSION,
            serial: 0,
            reply_serial: 0,
            path: None,
            interface: None,
            member: None,
            destination: None,
            sender: None,
            error: None,
            body: Vec::new(),
            rpos: 0,
            n_fds: 0,
            sealed: false,
            dont_send: false,
        }
    }

    /// A new method call addressed to `path`, member `member`.
    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Message> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }
        if !member_name_is_valid(member) {
            return Err(Error::InvalidArgument(format!("member name '{}'", member)));
        }
        if let Some(i) = interface {
            if !interface_name_is_valid(i) {
                return Err(Error::InvalidArgument(format!("interface name '{}'", i)));
            }
        }
        if let Some(d) = destination {
            if !service_name_is_valid(d) {
                return Err(Error::InvalidArgument(format!("service name '{}'", d)));
            }
        }

        let mut m = Message::blank(MessageType::MethodCall);
        m.path = Some(path.to_string());
        m.interface = interface.map(str::to_string);
        m.member = Some(member.to_string());
        m.destination = destination.map(str::to_string);
        Ok(m)
    }

    /// A successful reply to `call`. The call must be sealed.
    pub fn method_return(call: &Message) -> Result<Message> {
        Self::reply_to(call, MessageType::MethodReturn)
    }

    /// An error reply to `call`. The call must be sealed.
    pub fn method_error(call: &Message, error: BusError) -> Result<Message> {
        if !interface_name_is_valid(&error.name) {
            return Err(Error::InvalidArgument(format!("error name '{}'", error.name)));
        }

        let mut m = Self::reply_to(call, MessageType::MethodError)?;
        m.body.push(Value::Str(error.message.clone()));
        m.error = Some(error);
        Ok(m)
    }

    fn reply_to(call: &Message, ty: MessageType) -> Result<Message> {
        if call.ty != MessageType::MethodCall {
            return Err(Error::InvalidArgument("reply to a non-call message".into()));
        }
        if !call.sealed {
            return Err(Error::PermissionDenied("cannot reply to an unsealed call"));
        }

        let mut m = Message::blank(ty);
        m.reply_serial = call.serial;
        m.destination = call.sender.clone();
        m.dont_send = call.flags.contains(MessageFlags::NO_REPLY_EXPECTED);
        Ok(m)
    }

    /// A new signal emitted from `path`.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("object path '{}'", path)));
        }
        if !interface_name_is_valid(interface) {
            return Err(Error::InvalidArgument(format!("interface name '{}'", interface)));
        }
        if !member_name_is_valid(member) {
            return Err(Error::InvalidArgument(format!("member name '{}'", member)));
        }

        let mut m = Message::blank(MessageType::Signal);
        m.flags.insert(MessageFlags::NO_REPLY_EXPECTED);
        m.path = Some(path.to_string());
        m.interface = Some(interface.to_string());
        m.member = Some(member.to_string());
        Ok(m)
    }

    /// A locally synthesized error reply, e.g. the tracker's timeout error.
    /// Born sealed and never transmitted.
    pub(crate) fn synthetic_error(reply_serial: u64, error: BusError) -> Message {
        let mut m = Message::blank(MessageType::MethodError);
        m.flags.insert(MessageFlags::NO_REPLY_EXPECTED);
        m.reply_serial = reply_serial;
        m.body.push(Value::Str(error.message.clone()));
        m.error = Some(error);
        m.sealed = true;
        m
    }

    // ========================================================================
    // Header accessors
    // ========================================================================

    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Set header flags. Rejected once the message is sealed.
    pub fn set_flags(&mut self, flags: MessageFlags) -> Result<()> {
        if self.sealed {
            return Err(Error::PermissionDenied("message is sealed"));
        }
        self.flags = flags;
        Ok(())
    }

    /// Whether the sender asked for no reply.
    pub fn no_reply_expected(&self) -> bool {
        self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// The assigned serial; zero until sealed.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Serial of the call this message replies to; zero if none.
    pub fn reply_serial(&self) -> u64 {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The error payload of a method-error message.
    pub fn error(&self) -> Option<&BusError> {
        self.error.as_ref()
    }

    /// Number of file descriptors attached to this message.
    pub fn fd_count(&self) -> u32 {
        self.n_fds
    }

    /// Record attached file descriptors. Ownership semantics live with the
    /// codec collaborator; the engine only gates on the count.
    pub fn set_fd_count(&mut self, n: u32) -> Result<()> {
        if self.sealed {
            return Err(Error::PermissionDenied("message is sealed"));
        }
        self.n_fds = n;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn dont_send(&self) -> bool {
        self.dont_send
    }

    /// Whether this is a method call on `interface` for `member`.
    pub fn is_method_call(&self, interface: &str, member: &str) -> bool {
        self.ty == MessageType::MethodCall
            && self.interface.as_deref() == Some(interface)
            && self.member.as_deref() == Some(member)
    }

    // ========================================================================
    // Body
    // ========================================================================

    /// Append one value to the body. Rejected once sealed.
    pub fn append(&mut self, value: Value) -> Result<&mut Message> {
        if self.sealed {
            return Err(Error::PermissionDenied("message is sealed"));
        }
        self.body.push(value);
        Ok(self)
    }

    /// Append several values to the body.
    pub fn append_all(&mut self, values: impl IntoIterator<Item = Value>) -> Result<&mut Message> {
        for v in values {
            self.append(v)?;
        }
        Ok(self)
    }

    /// The full body, independent of the read cursor.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Read the next body value, advancing the cursor.
    pub fn read(&mut self) -> Option<&Value> {
        let v = self.body.get(self.rpos)?;
        self.rpos += 1;
        Some(v)
    }

    /// Read the next body value as a string, advancing the cursor.
    pub fn read_str(&mut self) -> Option<&str> {
        let v = self.body.get(self.rpos)?;
        self.rpos += 1;
        v.as_str()
    }

    /// Reset the read cursor to the first body value.
    pub fn rewind(&mut self) {
        self.rpos = 0;
    }

    /// Signature of the body: concatenation of each value's signature.
    pub fn signature(&self) -> String {
        self.body.iter().map(|v| v.signature()).collect()
    }

    // ========================================================================
    // Sealing
    // ========================================================================

    /// Assign `serial` and freeze the message. A message seals exactly once;
    /// serial zero is reserved.
    pub(crate) fn seal(&mut self, serial: u64) -> Result<()> {
        if self.sealed {
            return Err(Error::PermissionDenied("message is already sealed"));
        }
        if serial == 0 {
            return Err(Error::InvalidArgument("serial zero is reserved".into()));
        }

        self.serial = serial;
        self.sealed = true;
        Ok(())
    }

    /// Test hook: build an inbound-looking sealed message in one step.
    #[cfg(test)]
    pub(crate) fn sealed_with(mut self, serial: u64) -> Message {
        self.serial = serial;
        self.sealed = true;
        self
    }

    // Decoder-side constructor: the frame codec reassembles messages with
    // every header field already fixed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        ty: MessageType,
        flags: MessageFlags,
        version: u8,
        serial: u64,
        reply_serial: u64,
        path: Option<String>,
        interface: Option<String>,
        member: Option<String>,
        destination: Option<String>,
        sender: Option<String>,
        error: Option<BusError>,
        n_fds: u32,
        body: Vec<Value>,
    ) -> Message {
        Message {
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
            body,
            rpos: 0,
            n_fds,
            sealed: true,
            dont_send: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_call_validates_names() {
        assert!(Message::method_call(None, "/foo", Some("org.example.Iface"), "Bar").is_ok());
        assert!(Message::method_call(None, "foo", None, "Bar").is_err());
        assert!(Message::method_call(None, "/foo", Some("noseg"), "Bar").is_err());
        assert!(Message::method_call(None, "/foo", None, "2bad").is_err());
        assert!(Message::method_call(Some("1.42"), "/foo", None, "Bar").is_err());
    }

    #[test]
    fn test_seal_once() {
        let mut m = Message::method_call(None, "/", None, "Ping").unwrap();
        assert!(!m.is_sealed());
        m.seal(7).unwrap();
        assert!(m.is_sealed());
        assert_eq!(m.serial(), 7);
        assert!(m.seal(8).is_err());
        assert!(m.append(Value::Byte(1)).is_err());
    }

    #[test]
    fn test_serial_zero_reserved() {
        let mut m = Message::method_call(None, "/", None, "Ping").unwrap();
        assert!(m.seal(0).is_err());
    }

    #[test]
    fn test_reply_requires_sealed_call() {
        let call = Message::method_call(None, "/", None, "Ping").unwrap();
        assert!(Message::method_return(&call).is_err());

        let call = call.sealed_with(3);
        let reply = Message::method_return(&call).unwrap();
        assert_eq!(reply.reply_serial(), 3);
        assert_eq!(reply.message_type(), MessageType::MethodReturn);
    }

    #[test]
    fn test_reply_suppression_flag() {
        let mut call = Message::method_call(None, "/", None, "Ping").unwrap();
        call.set_flags(MessageFlags::NO_REPLY_EXPECTED).unwrap();
        let call = call.sealed_with(3);

        let reply = Message::method_return(&call).unwrap();
        assert!(reply.dont_send());
    }

    #[test]
    fn test_body_cursor() {
        let mut m = Message::signal("/o", "org.example.Iface", "Changed").unwrap();
        m.append(Value::string("a")).unwrap();
        m.append(Value::U32(7)).unwrap();

        assert_eq!(m.read_str(), Some("a"));
        assert_eq!(m.read(), Some(&Value::U32(7)));
        assert_eq!(m.read(), None);

        m.rewind();
        assert_eq!(m.read_str(), Some("a"));
    }

    #[test]
    fn test_signature_rendering() {
        let mut m = Message::signal("/o", "org.example.Iface", "Changed").unwrap();
        m.append(Value::string("s")).unwrap();
        m.append(Value::property_dict(vec![("A".into(), Value::U32(1))]))
            .unwrap();
        m.append(Value::Array {
            element: "s".into(),
            items: vec![],
        })
        .unwrap();

        assert_eq!(m.signature(), "sa{sv}as");
    }

    #[test]
    fn test_synthetic_error_is_sealed() {
        let m = Message::synthetic_error(
            9,
            BusError::new("org.freedesktop.DBus.Error.Timeout", "Timed out"),
        );
        assert!(m.is_sealed());
        assert_eq!(m.reply_serial(), 9);
        assert_eq!(m.serial(), 0);
        assert!(m.no_reply_expected());
        assert_eq!(
            m.error().map(|e| e.name.as_str()),
            Some("org.freedesktop.DBus.Error.Timeout")
        );
    }

    #[test]
    fn test_variant_signature() {
        let v = Value::variant(Value::string("hi"));
        assert_eq!(v.signature(), "v");
        let nested = Value::Struct(vec![Value::I32(1), Value::string("x")]);
        assert_eq!(nested.signature(), "(is)");
    }
}
