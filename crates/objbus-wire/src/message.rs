//! Message framing.
//!
//! A message is a 16-byte fixed header (byte order, type, flags, protocol
//! version, body length, serial), an `a(yv)` array of header fields padded
//! to 8 bytes, and the body. Messages are always written little-endian and
//! read in either byte order.

use crate::error::{WireError, WireResult};
use crate::iter::{BodyReader, BodyWriter, Endianness};
use crate::marshal::{decode_body, decode_value, encode_body, signature_of};
use objbus_types::{ObjectPath, Signature, TypedValue};
use std::fmt;

pub const PROTOCOL_VERSION: u8 = 1;
/// Length of the fixed part of the header.
pub const FIXED_HEADER_LEN: usize = 16;
/// Default maximum total message size (128 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 128 * 1024 * 1024;

/// The sender does not want a reply.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;
/// Do not launch an owner for the destination name.
pub const FLAG_NO_AUTO_START: u8 = 0x2;
/// The caller is prepared to wait for interactive authorization.
pub const FLAG_ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    /// Name used in match rules.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "method_call" => Some(MessageType::MethodCall),
            "method_return" => Some(MessageType::MethodReturn),
            "error" => Some(MessageType::Error),
            "signal" => Some(MessageType::Signal),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded message: header fields plus the body values.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: u8,
    /// Assigned by the sending connection; zero until then.
    pub serial: u32,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Signature,
    pub body: Vec<TypedValue>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: 0,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Vec::new(),
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: ObjectPath,
        interface: Option<&str>,
        member: &str,
    ) -> Self {
        Self {
            path: Some(path),
            interface: interface.map(str::to_string),
            member: Some(member.to_string()),
            destination: destination.map(str::to_string),
            ..Self::empty(MessageType::MethodCall)
        }
    }

    pub fn signal(path: ObjectPath, interface: &str, member: &str) -> Self {
        Self {
            path: Some(path),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            ..Self::empty(MessageType::Signal)
        }
    }

    /// A successful reply to `call`.
    pub fn method_return(call: &Message) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::empty(MessageType::MethodReturn)
        }
    }

    /// An error reply to `call` carrying `text` as its single string argument.
    pub fn error(call: &Message, name: &str, text: &str) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            error_name: Some(name.to_string()),
            ..Self::empty(MessageType::Error)
        }
        .with_args(vec![TypedValue::String(text.to_string())])
    }

    /// Replace the body, deriving the signature from the values.
    pub fn with_args(mut self, args: Vec<TypedValue>) -> Self {
        self.signature = signature_of(&args);
        self.body = args;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn args(&self) -> &[TypedValue] {
        &self.body
    }

    pub fn arg(&self, index: usize) -> Option<&TypedValue> {
        self.body.get(index)
    }

    /// A method call without the no-reply flag.
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall && self.flags & FLAG_NO_REPLY_EXPECTED == 0
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self.message_type,
            MessageType::MethodReturn | MessageType::Error
        )
    }

    /// The human-readable text of an error message.
    pub fn error_text(&self) -> &str {
        self.body
            .first()
            .and_then(TypedValue::as_str)
            .unwrap_or_default()
    }

    pub fn path_str(&self) -> &str {
        self.path.as_ref().map(ObjectPath::as_str).unwrap_or_default()
    }

    pub fn interface_str(&self) -> &str {
        self.interface.as_deref().unwrap_or_default()
    }

    pub fn member_str(&self) -> &str {
        self.member.as_deref().unwrap_or_default()
    }

    fn validate(&self) -> WireResult<()> {
        match self.message_type {
            MessageType::MethodCall => {
                self.path.as_ref().ok_or(WireError::MissingHeaderField("path"))?;
                self.member
                    .as_ref()
                    .ok_or(WireError::MissingHeaderField("member"))?;
            }
            MessageType::Signal => {
                self.path.as_ref().ok_or(WireError::MissingHeaderField("path"))?;
                self.interface
                    .as_ref()
                    .ok_or(WireError::MissingHeaderField("interface"))?;
                self.member
                    .as_ref()
                    .ok_or(WireError::MissingHeaderField("member"))?;
            }
            MessageType::Error => {
                self.error_name
                    .as_ref()
                    .ok_or(WireError::MissingHeaderField("error_name"))?;
                self.reply_serial
                    .ok_or(WireError::MissingHeaderField("reply_serial"))?;
            }
            MessageType::MethodReturn => {
                self.reply_serial
                    .ok_or(WireError::MissingHeaderField("reply_serial"))?;
            }
        }
        Ok(())
    }

    /// Serialize to wire bytes (little-endian).
    pub fn to_bytes(&self) -> WireResult<Vec<u8>> {
        if self.serial == 0 {
            return Err(WireError::InvalidHeader("serial must be non-zero".into()));
        }
        self.validate()?;
        let body = encode_body(self.signature.as_str(), &self.body);

        let mut w = BodyWriter::new();
        w.write_u8(Endianness::Little.as_byte());
        w.write_u8(self.message_type.as_byte());
        w.write_u8(self.flags);
        w.write_u8(PROTOCOL_VERSION);
        w.write_u32(body.len() as u32);
        w.write_u32(self.serial);

        let len_pos = w.position();
        w.write_u32(0);
        w.pad(8);
        let start = w.position();
        let field = |w: &mut BodyWriter, code: u8, sig: &str| {
            w.pad(8);
            w.write_u8(code);
            w.write_signature(sig);
        };
        if let Some(path) = &self.path {
            field(&mut w, FIELD_PATH, "o");
            w.write_str(path.as_str());
        }
        if let Some(interface) = &self.interface {
            field(&mut w, FIELD_INTERFACE, "s");
            w.write_str(interface);
        }
        if let Some(member) = &self.member {
            field(&mut w, FIELD_MEMBER, "s");
            w.write_str(member);
        }
        if let Some(error_name) = &self.error_name {
            field(&mut w, FIELD_ERROR_NAME, "s");
            w.write_str(error_name);
        }
        if let Some(reply_serial) = self.reply_serial {
            field(&mut w, FIELD_REPLY_SERIAL, "u");
            w.write_u32(reply_serial);
        }
        if let Some(destination) = &self.destination {
            field(&mut w, FIELD_DESTINATION, "s");
            w.write_str(destination);
        }
        if let Some(sender) = &self.sender {
            field(&mut w, FIELD_SENDER, "s");
            w.write_str(sender);
        }
        if !self.signature.is_empty() {
            field(&mut w, FIELD_SIGNATURE, "g");
            w.write_signature(self.signature.as_str());
        }
        let fields_len = w.position() - start;
        w.patch_u32(len_pos, fields_len as u32);
        w.pad(8);
        w.write_bytes(&body);

        let total = w.position() as u64;
        if total > u64::from(MAX_MESSAGE_SIZE) {
            return Err(WireError::MessageTooLarge {
                size: total,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(w.into_bytes())
    }

    /// Parse one message from the front of `data`, returning it and the
    /// number of bytes consumed.
    pub fn from_bytes(data: &[u8], max_size: u32) -> WireResult<(Message, usize)> {
        let total = frame_length(data, max_size)?;
        if data.len() < total {
            return Err(WireError::UnexpectedEof(data.len()));
        }
        let endian = Endianness::from_byte(data[0])
            .ok_or_else(|| WireError::InvalidHeader(format!("bad byte order {:#x}", data[0])))?;
        let mut r = BodyReader::new(&data[..total], endian);
        r.read_u8()?;
        let type_byte = r.read_u8()?;
        let message_type = MessageType::from_byte(type_byte)
            .ok_or_else(|| WireError::InvalidHeader(format!("unknown message type {type_byte}")))?;
        let flags = r.read_u8()?;
        r.read_u8()?;
        let body_len = r.read_u32()? as usize;
        let serial = r.read_u32()?;
        if serial == 0 {
            return Err(WireError::InvalidHeader("serial must be non-zero".into()));
        }

        let mut msg = Message::empty(message_type);
        msg.flags = flags;
        msg.serial = serial;

        let fields_len = r.read_u32()? as usize;
        r.align(8)?;
        let fields_end = r.position() + fields_len;
        while r.position() < fields_end {
            r.align(8)?;
            let code = r.read_u8()?;
            let sig = r.read_signature()?;
            let bad = || WireError::InvalidHeader(format!("field {code} has type '{sig}'"));
            match (code, sig) {
                (FIELD_PATH, "o") => msg.path = Some(ObjectPath::new(r.read_str()?)?),
                (FIELD_INTERFACE, "s") => msg.interface = Some(r.read_str()?.to_string()),
                (FIELD_MEMBER, "s") => msg.member = Some(r.read_str()?.to_string()),
                (FIELD_ERROR_NAME, "s") => msg.error_name = Some(r.read_str()?.to_string()),
                (FIELD_REPLY_SERIAL, "u") => msg.reply_serial = Some(r.read_u32()?),
                (FIELD_DESTINATION, "s") => msg.destination = Some(r.read_str()?.to_string()),
                (FIELD_SENDER, "s") => msg.sender = Some(r.read_str()?.to_string()),
                (FIELD_SIGNATURE, "g") => msg.signature = Signature::new(r.read_signature()?)?,
                (FIELD_UNIX_FDS, "u") => {
                    if r.read_u32()? != 0 {
                        return Err(WireError::UnsupportedType('h'));
                    }
                }
                (FIELD_PATH..=FIELD_UNIX_FDS, _) => return Err(bad()),
                // unknown fields are skipped
                (_, _) => {
                    Signature::single(sig)?;
                    decode_value(&mut r, sig, 1)?;
                }
            }
        }
        if r.position() != fields_end {
            return Err(WireError::InvalidHeader("header fields overrun".into()));
        }
        r.align(8)?;
        let body_start = r.position();
        if body_start + body_len != total {
            return Err(WireError::InvalidHeader("body length mismatch".into()));
        }
        msg.validate()?;
        msg.body = decode_body(&data[body_start..total], msg.signature.as_str(), endian)?;
        Ok((msg, total))
    }
}

/// Total length of the message whose first bytes are `header`, from the
/// fixed header alone. Needs at least [`FIXED_HEADER_LEN`] bytes.
pub fn frame_length(header: &[u8], max_size: u32) -> WireResult<usize> {
    if header.len() < FIXED_HEADER_LEN {
        return Err(WireError::UnexpectedEof(header.len()));
    }
    let endian = Endianness::from_byte(header[0])
        .ok_or_else(|| WireError::InvalidHeader(format!("bad byte order {:#x}", header[0])))?;
    if header[3] != PROTOCOL_VERSION {
        return Err(WireError::ProtocolVersion(header[3]));
    }
    let word = |at: usize| {
        let bytes = [header[at], header[at + 1], header[at + 2], header[at + 3]];
        match endian {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    };
    let body_len = u64::from(word(4));
    let fields_len = u64::from(word(12));
    let header_len = (FIXED_HEADER_LEN as u64 + fields_len).div_ceil(8) * 8;
    let total = header_len + body_len;
    if total > u64::from(max_size) {
        return Err(WireError::MessageTooLarge {
            size: total,
            max: max_size,
        });
    }
    Ok(total as usize)
}
