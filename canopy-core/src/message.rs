//! The universal message unit of the overlay.
//!
//! A message is a typed multipart value: an optional route stack, an optional
//! topic, an optional opaque payload, and a fixed-layout proto section that
//! always travels as the final frame. Two codecs are provided: a
//! length-prefixed byte-stream form (`encode`/`decode`) and the multipart
//! frame form used on router/dealer sockets (`to_frames`/`from_frames`).
//!
//! Messages are cheap to clone: frames are `Bytes` and the route stack is a
//! small inline vector. The cached JSON parse is an annotation and never
//! changes externally observable state.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::cell::OnceCell;
use std::fmt;

use crate::error::{Error, Result};

/// First byte of every proto frame.
pub const MESSAGE_MAGIC: u8 = 0x8e;
/// Wire protocol version.
pub const MESSAGE_VERSION: u8 = 1;
/// Fixed size of the proto frame in bytes.
pub const PROTO_SIZE: usize = 20;

/// Matchtag value meaning "no correlation".
pub const MATCHTAG_NONE: u32 = 0;
/// Nodeid wildcard: route to wherever the service lives.
pub const NODEID_ANY: u32 = u32::MAX;
/// Userid placeholder before authentication attribution.
pub const USERID_UNKNOWN: u32 = u32::MAX;

/// The four message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    Event = 4,
    Keepalive = 8,
}

impl MessageType {
    /// Decode a proto type byte.
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            4 => Ok(Self::Event),
            8 => Ok(Self::Keepalive),
            other => Err(Error::protocol(format!("unknown message type {other:#04x}"))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Keepalive => "keepalive",
        };
        f.write_str(s)
    }
}

/// Message flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags(u8);

impl MsgFlags {
    pub const TOPIC: Self = Self(0x01);
    pub const PAYLOAD: Self = Self(0x02);
    pub const NORESPONSE: Self = Self(0x04);
    pub const ROUTE: Self = Self(0x08);
    pub const UPSTREAM: Self = Self(0x10);
    pub const PRIVATE: Self = Self(0x20);
    pub const STREAMING: Self = Self(0x40);

    const ALL: u8 = 0x7f;

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Decode a proto flags byte, rejecting unknown bits and the
    /// streaming/no-response contradiction.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(Error::protocol(format!("unknown flag bits {bits:#04x}")));
        }
        let flags = Self(bits);
        flags.check()?;
        Ok(flags)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Streaming and no-response are mutually exclusive.
    pub fn check(self) -> Result<()> {
        if self.contains(Self::STREAMING) && self.contains(Self::NORESPONSE) {
            return Err(Error::protocol(
                "streaming and noresponse flags are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for MsgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::TOPIC, "topic"),
            (Self::PAYLOAD, "payload"),
            (Self::NORESPONSE, "noresponse"),
            (Self::ROUTE, "route"),
            (Self::UPSTREAM, "upstream"),
            (Self::PRIVATE, "private"),
            (Self::STREAMING, "streaming"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Role bits carried on every message and checked against handler
/// requirements at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleMask(u32);

impl RoleMask {
    pub const NONE: Self = Self(0);
    pub const OWNER: Self = Self(1);
    pub const USER: Self = Self(2);
    pub const ALL: Self = Self(u32::MAX);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for RoleMask {
    fn default() -> Self {
        Self::OWNER
    }
}

/// Liveness status carried by keepalive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeepaliveStatus {
    Normal = 0,
    Disconnect = 1,
    TestPause = 2,
}

impl KeepaliveStatus {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Disconnect),
            2 => Ok(Self::TestPause),
            other => Err(Error::protocol(format!("unknown keepalive status {other}"))),
        }
    }
}

/// A route identifier frame. Identifiers are short ASCII strings synthesized
/// from integer ranks, so `uuid_for_rank(5)` is `"5"`.
#[must_use]
pub fn uuid_for_rank(rank: u32) -> Bytes {
    Bytes::from(rank.to_string())
}

type RouteStack = SmallVec<[Bytes; 4]>;

/// The universal message unit. See the module docs for the wire layout.
#[derive(Debug, Default)]
pub struct Message {
    typ: Option<MessageType>,
    flags: MsgFlags,
    userid: u32,
    rolemask: RoleMask,
    aux1: u32,
    aux2: u32,
    topic: Option<String>,
    payload: Bytes,
    /// Bottom (originator) first, most recent hop last.
    route: RouteStack,
    /// Cached payload parse; annotation only, excluded from equality.
    json: OnceCell<serde_json::Value>,
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            typ: self.typ,
            flags: self.flags,
            userid: self.userid,
            rolemask: self.rolemask,
            aux1: self.aux1,
            aux2: self.aux2,
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            route: self.route.clone(),
            json: self.json.clone(),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.typ == other.typ
            && self.flags == other.flags
            && self.userid == other.userid
            && self.rolemask == other.rolemask
            && self.aux1 == other.aux1
            && self.aux2 == other.aux2
            && self.topic == other.topic
            && self.payload == other.payload
            && self.route == other.route
    }
}

impl Message {
    /// Create a message of the given type with default proto fields.
    #[must_use]
    pub fn create(typ: MessageType) -> Self {
        Self {
            typ: Some(typ),
            userid: USERID_UNKNOWN,
            aux1: if typ == MessageType::Request { NODEID_ANY } else { 0 },
            ..Self::default()
        }
    }

    /// Convenience: a request with a topic set.
    pub fn request(topic: &str) -> Result<Self> {
        let mut msg = Self::create(MessageType::Request);
        msg.set_topic(topic)?;
        Ok(msg)
    }

    /// Convenience: a response derived from a request. Copies topic, matchtag,
    /// userid, rolemask, and the route stack.
    pub fn response_for(request: &Self) -> Result<Self> {
        if request.typ != Some(MessageType::Request) {
            return Err(Error::protocol("response_for needs a request".to_string()));
        }
        let mut msg = Self::create(MessageType::Response);
        if let Some(topic) = request.topic() {
            msg.set_topic(topic)?;
        }
        msg.userid = request.userid;
        msg.rolemask = request.rolemask;
        msg.set_matchtag(request.matchtag()?)?;
        if request.has_route_stack() {
            msg.enable_route_stack();
            msg.route = request.route.clone();
        }
        Ok(msg)
    }

    pub fn typ(&self) -> Result<MessageType> {
        self.typ
            .ok_or_else(|| Error::protocol("message has no type".to_string()))
    }

    pub fn set_type(&mut self, typ: MessageType) {
        self.typ = Some(typ);
    }

    #[must_use]
    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    /// Set auxiliary flag bits. The topic/payload/route bits are managed
    /// internally and rejected here.
    pub fn set_flag(&mut self, flag: MsgFlags) -> Result<()> {
        if flag.contains(MsgFlags::TOPIC)
            || flag.contains(MsgFlags::PAYLOAD)
            || flag.contains(MsgFlags::ROUTE)
        {
            return Err(Error::invalid("flag is managed internally"));
        }
        let mut merged = self.flags;
        merged.insert(flag);
        merged.check()?;
        self.flags = merged;
        Ok(())
    }

    #[must_use]
    pub fn userid(&self) -> u32 {
        self.userid
    }

    pub fn set_userid(&mut self, userid: u32) {
        self.userid = userid;
    }

    #[must_use]
    pub fn rolemask(&self) -> RoleMask {
        self.rolemask
    }

    pub fn set_rolemask(&mut self, rolemask: RoleMask) {
        self.rolemask = rolemask;
    }

    // === type-specific aux accessors ===

    fn expect_type(&self, wanted: &[MessageType], what: &str) -> Result<()> {
        let typ = self.typ()?;
        if wanted.contains(&typ) {
            Ok(())
        } else {
            Err(Error::protocol(format!("{what} not valid on {typ} message")))
        }
    }

    /// Destination rank. Requests only.
    pub fn nodeid(&self) -> Result<u32> {
        self.expect_type(&[MessageType::Request], "nodeid")?;
        Ok(self.aux1)
    }

    pub fn set_nodeid(&mut self, nodeid: u32) -> Result<()> {
        self.expect_type(&[MessageType::Request], "nodeid")?;
        self.aux1 = nodeid;
        Ok(())
    }

    /// Correlation tag. Requests and responses.
    pub fn matchtag(&self) -> Result<u32> {
        self.expect_type(&[MessageType::Request, MessageType::Response], "matchtag")?;
        Ok(self.aux2)
    }

    pub fn set_matchtag(&mut self, matchtag: u32) -> Result<()> {
        self.expect_type(&[MessageType::Request, MessageType::Response], "matchtag")?;
        self.aux2 = matchtag;
        Ok(())
    }

    /// Error code. Responses and keepalives.
    pub fn errnum(&self) -> Result<i32> {
        self.expect_type(&[MessageType::Response, MessageType::Keepalive], "errnum")?;
        Ok(self.aux1 as i32)
    }

    pub fn set_errnum(&mut self, errnum: i32) -> Result<()> {
        self.expect_type(&[MessageType::Response, MessageType::Keepalive], "errnum")?;
        self.aux1 = errnum as u32;
        Ok(())
    }

    /// Event sequence number.
    pub fn sequence(&self) -> Result<u32> {
        self.expect_type(&[MessageType::Event], "sequence")?;
        Ok(self.aux1)
    }

    pub fn set_sequence(&mut self, seq: u32) -> Result<()> {
        self.expect_type(&[MessageType::Event], "sequence")?;
        self.aux1 = seq;
        Ok(())
    }

    /// Keepalive liveness status.
    pub fn status(&self) -> Result<KeepaliveStatus> {
        self.expect_type(&[MessageType::Keepalive], "status")?;
        KeepaliveStatus::from_u32(self.aux2)
    }

    pub fn set_status(&mut self, status: KeepaliveStatus) -> Result<()> {
        self.expect_type(&[MessageType::Keepalive], "status")?;
        self.aux2 = status as u32;
        Ok(())
    }

    // === topic ===

    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn set_topic(&mut self, topic: &str) -> Result<()> {
        if topic.is_empty() || !topic.is_ascii() {
            return Err(Error::invalid("topic must be non-empty ASCII"));
        }
        self.topic = Some(topic.to_string());
        self.flags.insert(MsgFlags::TOPIC);
        Ok(())
    }

    pub fn clear_topic(&mut self) {
        self.topic = None;
        self.flags.remove(MsgFlags::TOPIC);
    }

    // === payload ===

    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.flags.contains(MsgFlags::PAYLOAD)
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload. A zero-length payload clears the payload flag.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        self.json = OnceCell::new();
        if self.payload.is_empty() {
            self.flags.remove(MsgFlags::PAYLOAD);
        } else {
            self.flags.insert(MsgFlags::PAYLOAD);
        }
    }

    /// Set a string payload. Strings travel NUL-terminated on the wire.
    pub fn set_payload_string(&mut self, s: &str) {
        let mut buf = BytesMut::with_capacity(s.len() + 1);
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
        self.set_payload(buf.freeze());
    }

    /// Serialize a value to a NUL-terminated JSON payload.
    pub fn set_payload_json<T: serde::Serialize>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)
            .map_err(|e| Error::protocol(format!("payload encode: {e}")))?;
        self.set_payload_string(&text);
        Ok(())
    }

    /// Borrow the payload as a string. Fails unless NUL-terminated UTF-8.
    pub fn payload_str(&self) -> Result<&str> {
        let Some((&0, body)) = self.payload.split_last() else {
            return Err(Error::protocol("payload string not NUL terminated".to_string()));
        };
        std::str::from_utf8(body).map_err(|e| Error::protocol(format!("payload not UTF-8: {e}")))
    }

    /// Parse the payload as JSON, caching the result for repeated access.
    pub fn payload_json(&self) -> Result<&serde_json::Value> {
        if let Some(v) = self.json.get() {
            return Ok(v);
        }
        let text = self.payload_str()?;
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("payload not JSON: {e}")))?;
        let _ = self.json.set(value);
        Ok(self.json.get().expect("just set"))
    }

    /// Decode the JSON payload into a typed value.
    pub fn payload_decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let value = self.payload_json()?.clone();
        serde_json::from_value(value).map_err(|e| Error::protocol(format!("payload decode: {e}")))
    }

    // === route stack ===

    #[must_use]
    pub fn has_route_stack(&self) -> bool {
        self.flags.contains(MsgFlags::ROUTE)
    }

    /// Enable the route stack. Enablement is orthogonal to content.
    pub fn enable_route_stack(&mut self) {
        self.flags.insert(MsgFlags::ROUTE);
    }

    /// Disable the route stack, clearing any content.
    pub fn disable_route_stack(&mut self) {
        self.flags.remove(MsgFlags::ROUTE);
        self.route.clear();
    }

    /// Enablement is orthogonal to content; disabling clears it.
    pub fn set_route_stack_enabled(&mut self, enabled: bool) {
        if enabled {
            self.enable_route_stack();
        } else {
            self.disable_route_stack();
        }
    }

    /// Drop all route frames but keep the stack enabled.
    pub fn clear_route(&mut self) {
        self.route.clear();
    }

    /// Push an identifier onto the top of the stack.
    pub fn push_route(&mut self, id: impl Into<Bytes>) -> Result<()> {
        if !self.has_route_stack() {
            return Err(Error::protocol("route stack not enabled".to_string()));
        }
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid("route id must be non-empty"));
        }
        self.route.push(id);
        Ok(())
    }

    /// Pop the most recent hop off the stack.
    pub fn pop_route(&mut self) -> Result<Option<Bytes>> {
        if !self.has_route_stack() {
            return Err(Error::protocol("route stack not enabled".to_string()));
        }
        Ok(self.route.pop())
    }

    /// The originator's identifier (bottom of the stack).
    #[must_use]
    pub fn first_route(&self) -> Option<&[u8]> {
        self.route.first().map(|b| b.as_ref())
    }

    /// The most recent router's identifier (top of the stack).
    #[must_use]
    pub fn last_route(&self) -> Option<&[u8]> {
        self.route.last().map(|b| b.as_ref())
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.route.len()
    }

    /// Route identifiers bottom to top.
    #[must_use]
    pub fn routes(&self) -> &[Bytes] {
        &self.route
    }

    // === copying ===

    /// Clone the message. With `deep_payload`, the payload bytes are copied
    /// into fresh storage instead of sharing the underlying buffer.
    #[must_use]
    pub fn copy(&self, deep_payload: bool) -> Self {
        let mut msg = self.clone();
        if deep_payload {
            msg.payload = Bytes::copy_from_slice(&self.payload);
        }
        msg
    }

    // === byte-stream codec ===

    /// Total number of frames the encoded form carries.
    #[must_use]
    pub fn frames(&self) -> usize {
        let mut n = 1; // proto
        if self.has_route_stack() {
            n += self.route.len() + 1; // identifiers + delimiter
        }
        if self.topic.is_some() {
            n += 1;
        }
        if self.has_payload() {
            n += 1;
        }
        n
    }

    fn frame_overhead(len: usize) -> usize {
        if len < 0xff {
            1
        } else {
            5
        }
    }

    /// Exact size of the byte-stream encoding.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        let mut size = Self::frame_overhead(PROTO_SIZE) + PROTO_SIZE;
        if self.has_route_stack() {
            for id in &self.route {
                size += Self::frame_overhead(id.len()) + id.len();
            }
            size += Self::frame_overhead(0); // delimiter
        }
        if let Some(topic) = &self.topic {
            size += Self::frame_overhead(topic.len()) + topic.len();
        }
        if self.has_payload() {
            size += Self::frame_overhead(self.payload.len()) + self.payload.len();
        }
        size
    }

    fn put_frame(buf: &mut BytesMut, frame: &[u8]) {
        if frame.len() < 0xff {
            buf.put_u8(frame.len() as u8);
        } else {
            buf.put_u8(0xff);
            buf.put_u32(frame.len() as u32);
        }
        buf.put_slice(frame);
    }

    fn proto_frame(&self) -> Result<[u8; PROTO_SIZE]> {
        let typ = self.typ()?;
        self.flags.check()?;
        let mut proto = [0u8; PROTO_SIZE];
        proto[0] = MESSAGE_MAGIC;
        proto[1] = MESSAGE_VERSION;
        proto[2] = typ as u8;
        proto[3] = self.flags.bits();
        proto[4..8].copy_from_slice(&self.userid.to_be_bytes());
        proto[8..12].copy_from_slice(&self.rolemask.bits().to_be_bytes());
        proto[12..16].copy_from_slice(&self.aux1.to_be_bytes());
        proto[16..20].copy_from_slice(&self.aux2.to_be_bytes());
        Ok(proto)
    }

    /// Append the byte-stream encoding to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let proto = self.proto_frame()?;
        buf.reserve(self.encoded_size());
        if self.has_route_stack() {
            // Bottom first, most recent hop written last.
            for id in &self.route {
                Self::put_frame(buf, id);
            }
            Self::put_frame(buf, b"");
        }
        if let Some(topic) = &self.topic {
            Self::put_frame(buf, topic.as_bytes());
        }
        if self.has_payload() {
            Self::put_frame(buf, &self.payload);
        }
        Self::put_frame(buf, &proto);
        Ok(())
    }

    /// Encode into a caller-provided buffer, returning the bytes written.
    /// A short buffer fails up front with no partial write.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.encoded_size();
        if buf.len() < need {
            return Err(Error::Overflow(format!(
                "encode needs {need} bytes, buffer has {}",
                buf.len()
            )));
        }
        let mut out = BytesMut::with_capacity(need);
        self.encode_into(&mut out)?;
        debug_assert_eq!(out.len(), need);
        buf[..need].copy_from_slice(&out);
        Ok(need)
    }

    /// Encode into a fresh buffer.
    pub fn encode_vec(&self) -> Result<Vec<u8>> {
        let mut out = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut out)?;
        Ok(out.to_vec())
    }

    fn split_frames(buf: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            let len = if buf[pos] < 0xff {
                let len = buf[pos] as usize;
                pos += 1;
                len
            } else {
                if buf.len() - pos < 5 {
                    return Err(Error::protocol("truncated frame length".to_string()));
                }
                let mut be = [0u8; 4];
                be.copy_from_slice(&buf[pos + 1..pos + 5]);
                pos += 5;
                u32::from_be_bytes(be) as usize
            };
            if buf.len() - pos < len {
                return Err(Error::protocol("truncated frame body".to_string()));
            }
            frames.push(Bytes::copy_from_slice(&buf[pos..pos + len]));
            pos += len;
        }
        Ok(frames)
    }

    /// Decode a byte stream produced by [`Message::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let frames = Self::split_frames(buf)?;
        Self::assemble(frames, RouteOrder::BottomFirst)
    }

    // === multipart frame codec ===

    /// Emit frames in socket transmission order: most recent route hop first
    /// (a router strips it to pick the outbound peer), then delimiter, topic,
    /// payload, proto.
    pub fn to_frames(&self) -> Result<Vec<Bytes>> {
        let proto = self.proto_frame()?;
        let mut frames = Vec::with_capacity(self.frames());
        if self.has_route_stack() {
            for id in self.route.iter().rev() {
                frames.push(id.clone());
            }
            frames.push(Bytes::new());
        }
        if let Some(topic) = &self.topic {
            frames.push(Bytes::copy_from_slice(topic.as_bytes()));
        }
        if self.has_payload() {
            frames.push(self.payload.clone());
        }
        frames.push(Bytes::copy_from_slice(&proto));
        Ok(frames)
    }

    /// Rebuild a message from socket frames.
    pub fn from_frames<I, B>(frames: I) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let frames: Vec<Bytes> = frames.into_iter().map(Into::into).collect();
        Self::assemble(frames, RouteOrder::TopFirst)
    }

    fn assemble(frames: Vec<Bytes>, order: RouteOrder) -> Result<Self> {
        let Some(proto) = frames.last() else {
            return Err(Error::protocol("empty message".to_string()));
        };
        if proto.len() != PROTO_SIZE {
            return Err(Error::protocol(format!(
                "proto frame is {} bytes, want {PROTO_SIZE}",
                proto.len()
            )));
        }
        if proto[0] != MESSAGE_MAGIC {
            return Err(Error::protocol(format!("bad magic {:#04x}", proto[0])));
        }
        if proto[1] != MESSAGE_VERSION {
            return Err(Error::protocol(format!("bad version {}", proto[1])));
        }
        let typ = MessageType::from_u8(proto[2])?;
        let flags = MsgFlags::from_bits(proto[3])?;
        let word = |i: usize| {
            let mut be = [0u8; 4];
            be.copy_from_slice(&proto[i..i + 4]);
            u32::from_be_bytes(be)
        };

        let mut msg = Self {
            typ: Some(typ),
            flags,
            userid: word(4),
            rolemask: RoleMask::from_bits(word(8)),
            aux1: word(12),
            aux2: word(16),
            ..Self::default()
        };

        let body = &frames[..frames.len() - 1];
        let mut pos = 0usize;

        if flags.contains(MsgFlags::ROUTE) {
            let delim = body[pos..]
                .iter()
                .position(Bytes::is_empty)
                .ok_or_else(|| Error::protocol("route delimiter missing".to_string()))?;
            let ids = &body[pos..pos + delim];
            match order {
                RouteOrder::BottomFirst => msg.route.extend(ids.iter().cloned()),
                RouteOrder::TopFirst => msg.route.extend(ids.iter().rev().cloned()),
            }
            pos += delim + 1;
        }
        if flags.contains(MsgFlags::TOPIC) {
            let frame = body
                .get(pos)
                .ok_or_else(|| Error::protocol("topic frame missing".to_string()))?;
            let topic = std::str::from_utf8(frame)
                .map_err(|_| Error::protocol("topic not UTF-8".to_string()))?;
            msg.topic = Some(topic.to_string());
            pos += 1;
        }
        if flags.contains(MsgFlags::PAYLOAD) {
            let frame = body
                .get(pos)
                .ok_or_else(|| Error::protocol("payload frame missing".to_string()))?;
            msg.payload = frame.clone();
            pos += 1;
        }
        if pos != body.len() {
            return Err(Error::protocol(format!(
                "{} unexpected frames before proto",
                body.len() - pos
            )));
        }
        Ok(msg)
    }
}

enum RouteOrder {
    /// Byte-stream order: originator first.
    BottomFirst,
    /// Socket order: most recent hop first.
    TopFirst,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.typ {
            Some(typ) => write!(f, "{typ}")?,
            None => f.write_str("untyped")?,
        }
        if let Some(topic) = &self.topic {
            write!(f, " {topic}")?;
        }
        if self.route_count() > 0 {
            write!(f, " |{}|", self.route_count())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Message {
        let mut msg = Message::request("scratchpad.ll").unwrap();
        msg.set_nodeid(5).unwrap();
        msg.set_matchtag(42).unwrap();
        msg.set_payload_json(&serde_json::json!({"key": "x"})).unwrap();
        msg.enable_route_stack();
        msg.push_route(uuid_for_rank(0)).unwrap();
        msg.push_route(uuid_for_rank(2)).unwrap();
        msg
    }

    #[test]
    fn create_sets_type_defaults() {
        let msg = Message::create(MessageType::Request);
        assert_eq!(msg.typ().unwrap(), MessageType::Request);
        assert_eq!(msg.nodeid().unwrap(), NODEID_ANY);
        assert_eq!(msg.matchtag().unwrap(), MATCHTAG_NONE);
        assert_eq!(msg.userid(), USERID_UNKNOWN);
    }

    #[test]
    fn accessors_reject_wrong_type() {
        let msg = Message::create(MessageType::Response);
        assert!(msg.nodeid().is_err());
        assert!(msg.sequence().is_err());
        assert!(msg.status().is_err());
        assert!(msg.errnum().is_ok());

        let mut ka = Message::create(MessageType::Keepalive);
        ka.set_status(KeepaliveStatus::TestPause).unwrap();
        assert_eq!(ka.status().unwrap(), KeepaliveStatus::TestPause);
        assert!(ka.matchtag().is_err());
    }

    #[test]
    fn streaming_and_noresponse_conflict() {
        let mut msg = Message::create(MessageType::Request);
        msg.set_flag(MsgFlags::STREAMING).unwrap();
        assert!(msg.set_flag(MsgFlags::NORESPONSE).is_err());
        assert!(msg.flags().contains(MsgFlags::STREAMING));
        assert!(!msg.flags().contains(MsgFlags::NORESPONSE));
        assert!(MsgFlags::from_bits(0x44).is_err());
    }

    #[test]
    fn empty_payload_clears_flag() {
        let mut msg = Message::create(MessageType::Request);
        msg.set_payload(&b"data"[..]);
        assert!(msg.has_payload());
        msg.set_payload(Bytes::new());
        assert!(!msg.has_payload());
    }

    #[test]
    fn payload_string_requires_nul() {
        let mut msg = Message::create(MessageType::Request);
        msg.set_payload(&b"no terminator"[..]);
        assert!(msg.payload_str().is_err());
        msg.set_payload_string("hello");
        assert_eq!(msg.payload_str().unwrap(), "hello");
    }

    #[test]
    fn json_payload_round_trip() {
        let mut msg = Message::create(MessageType::Response);
        msg.set_payload_json(&serde_json::json!({"version": 3, "data": [1, 2]}))
            .unwrap();
        let v = msg.payload_json().unwrap();
        assert_eq!(v["version"], 3);
        // Cached parse returns the same value.
        let again = msg.payload_json().unwrap();
        assert_eq!(v, again);
    }

    #[test]
    fn route_stack_push_pop() {
        let mut msg = Message::create(MessageType::Request);
        assert!(msg.push_route(uuid_for_rank(1)).is_err());

        msg.enable_route_stack();
        msg.push_route(uuid_for_rank(0)).unwrap();
        msg.push_route(uuid_for_rank(2)).unwrap();
        assert_eq!(msg.route_count(), 2);
        assert_eq!(msg.first_route().unwrap(), b"0");
        assert_eq!(msg.last_route().unwrap(), b"2");

        let top = msg.pop_route().unwrap().unwrap();
        assert_eq!(&top[..], b"2");
        assert_eq!(msg.route_count(), 1);

        msg.disable_route_stack();
        assert_eq!(msg.route_count(), 0);
        assert!(!msg.has_route_stack());
    }

    #[test]
    fn encode_size_matches_encode() {
        for msg in [
            Message::create(MessageType::Keepalive),
            Message::request("a.b").unwrap(),
            sample_request(),
        ] {
            let encoded = msg.encode_vec().unwrap();
            assert_eq!(encoded.len(), msg.encoded_size());
        }
    }

    #[test]
    fn encode_short_buffer_fails() {
        let msg = sample_request();
        let mut buf = vec![0u8; msg.encoded_size() - 1];
        assert!(msg.encode(&mut buf).is_err());
        let mut buf = vec![0u8; msg.encoded_size()];
        assert_eq!(msg.encode(&mut buf).unwrap(), msg.encoded_size());
    }

    #[test]
    fn decode_inverts_encode() {
        let msg = sample_request();
        let decoded = Message::decode(&msg.encode_vec().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.first_route().unwrap(), b"0");
        assert_eq!(decoded.last_route().unwrap(), b"2");
    }

    #[test]
    fn decode_large_frame() {
        let mut msg = Message::create(MessageType::Event);
        msg.set_sequence(7).unwrap();
        msg.set_payload(Bytes::from(vec![0xabu8; 1000]));
        let encoded = msg.encode_vec().unwrap();
        // 1000-byte frame takes the 0xff + u32 length form.
        assert!(encoded.len() > 1000 + PROTO_SIZE + 5);
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[3, 1, 2]).is_err());

        let msg = sample_request();
        let mut encoded = msg.encode_vec().unwrap();
        // Corrupt the magic byte inside the trailing proto frame.
        let off = encoded.len() - PROTO_SIZE;
        encoded[off] = 0x7f;
        assert!(Message::decode(&encoded).is_err());

        // Wrong version.
        let mut encoded = msg.encode_vec().unwrap();
        encoded[off + 1] = 9;
        assert!(Message::decode(&encoded).is_err());

        // Truncated body.
        let encoded = msg.encode_vec().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 3]).is_err());
    }

    #[test]
    fn frames_round_trip_preserves_route_order() {
        let msg = sample_request();
        let frames = msg.to_frames().unwrap();
        // Most recent hop travels first so a router can strip it.
        assert_eq!(&frames[0][..], b"2");
        assert_eq!(&frames[1][..], b"0");
        assert!(frames[2].is_empty());

        let back = Message::from_frames(frames).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn from_frames_rejects_stray_frames() {
        let msg = Message::request("t").unwrap();
        let mut frames = msg.to_frames().unwrap();
        frames.insert(0, Bytes::from_static(b"stray"));
        assert!(Message::from_frames(frames).is_err());
    }

    #[test]
    fn response_for_copies_correlation() {
        let req = sample_request();
        let rsp = Message::response_for(&req).unwrap();
        assert_eq!(rsp.typ().unwrap(), MessageType::Response);
        assert_eq!(rsp.matchtag().unwrap(), 42);
        assert_eq!(rsp.topic().unwrap(), "scratchpad.ll");
        assert_eq!(rsp.route_count(), 2);
        assert_eq!(rsp.last_route().unwrap(), b"2");
    }

    #[test]
    fn copy_deep_detaches_payload() {
        let msg = sample_request();
        let shallow = msg.copy(false);
        let deep = msg.copy(true);
        assert_eq!(shallow, msg);
        assert_eq!(deep, msg);
    }
}
