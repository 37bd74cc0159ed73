//! TAK protocol framing.
//!
//! A [`TakMessage`] pairs an optional CoT event with optional protocol
//! support information and knows how to put both on the wire:
//!
//! - legacy (version 0): bare CoT XML
//! - mesh: `0xBF, varint(version), 0xBF, protobuf`
//! - stream: `0xBF, varint(length), protobuf`
//! - none: bare protobuf

use prost::Message;

use super::message::CoTMessage;
use super::takproto;
use crate::core::constants::{LEGACY_PROTO, SELF_MAX_PROTO, SELF_MIN_PROTO, TAKPROTO_MAGIC};
use crate::core::{CommoError, ContactUid, Result, TakProtoInfo};

/// Header written in front of a protobuf payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoHeader {
    /// Datagram and direct TCP: magic, version, magic.
    Mesh,
    /// Server streams: magic, payload length.
    Stream,
    /// No header.
    None,
}

/// Outcome of decoding a varint from a possibly incomplete buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Varint {
    /// Decoded value and the number of bytes consumed.
    Complete(u64, usize),
    /// More bytes are needed.
    Incomplete,
    /// More than ten bytes without a terminator.
    Invalid,
}

/// Append `value` as a protobuf varint.
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    prost::encoding::encode_varint(value, out);
}

/// Decode a varint from the front of `buf` without requiring it to be complete.
pub fn decode_varint(buf: &[u8]) -> Varint {
    let mut value: u64 = 0;
    for (i, b) in buf.iter().enumerate() {
        if i >= 10 {
            return Varint::Invalid;
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Varint::Complete(value, i + 1);
        }
    }
    if buf.len() >= 10 {
        Varint::Invalid
    } else {
        Varint::Incomplete
    }
}

/// Clamp an outbound protocol version to something we can emit.
pub fn check_proto_version(version: u32) -> u32 {
    if (SELF_MIN_PROTO..=SELF_MAX_PROTO).contains(&version) {
        version
    } else {
        LEGACY_PROTO
    }
}

/// A CoT event plus protocol information, ready for framing.
#[derive(Debug, Clone)]
pub struct TakMessage {
    cot: Option<CoTMessage>,
    proto_info: Option<TakProtoInfo>,
    contact_uid: Option<ContactUid>,
    version: u32,
}

impl TakMessage {
    /// Wrap a message for sending.
    ///
    /// With `our_uid` set the protobuf form advertises our supported range
    /// under that contact UID.
    pub fn new(cot: Option<CoTMessage>, our_uid: Option<&ContactUid>) -> Self {
        Self {
            cot,
            proto_info: our_uid.map(|_| TakProtoInfo::local()),
            contact_uid: our_uid.cloned(),
            version: LEGACY_PROTO,
        }
    }

    /// Parse bytes received from a datagram or direct TCP peer.
    ///
    /// Accepts legacy XML or a mesh header carrying a version we speak.
    pub fn parse_mesh(data: &[u8]) -> Result<Self> {
        match data.first() {
            None => Err(CommoError::Parse("empty message".into())),
            Some(&TAKPROTO_MAGIC) => {
                let (version, used) = match decode_varint(&data[1..]) {
                    Varint::Complete(v, n) => (v, n),
                    _ => return Err(CommoError::Parse("invalid version varint in mesh header".into())),
                };
                if version < u64::from(SELF_MIN_PROTO) || version > u64::from(SELF_MAX_PROTO) {
                    return Err(CommoError::Parse(format!("unsupported protocol version {version}")));
                }
                let rest = &data[1 + used..];
                match rest.first() {
                    Some(&TAKPROTO_MAGIC) => Self::parse_protobuf(&rest[1..], version as u32),
                    _ => Err(CommoError::Parse("missing second magic byte in mesh header".into())),
                }
            }
            Some(_) => Self::parse_xml(data),
        }
    }

    /// Parse a legacy XML payload.
    pub fn parse_xml(data: &[u8]) -> Result<Self> {
        let cot = CoTMessage::parse(data)?;
        Ok(Self {
            contact_uid: cot.contact_uid(),
            cot: Some(cot),
            proto_info: None,
            version: LEGACY_PROTO,
        })
    }

    /// Parse a bare protobuf payload (header already removed) that arrived
    /// at protocol `version`.
    pub fn parse_protobuf(payload: &[u8], version: u32) -> Result<Self> {
        let msg = takproto::TakMessage::decode(payload)
            .map_err(|e| CommoError::Parse(format!("protobuf decode failed: {e}")))?;
        let cot = msg.cot_event.as_ref().map(CoTMessage::from_cot_event).transpose()?;
        let (proto_info, contact_uid) = match msg.tak_control {
            Some(ctl) => {
                let min = if ctl.min_proto_version == 0 { SELF_MIN_PROTO } else { ctl.min_proto_version };
                let max = if ctl.max_proto_version == 0 { min } else { ctl.max_proto_version };
                if min > max {
                    return Err(CommoError::Parse(format!("invalid protocol range {min}..{max}")));
                }
                let uid = (!ctl.contact_uid.is_empty()).then(|| ContactUid::from(ctl.contact_uid));
                (Some(TakProtoInfo::new(min, max)), uid)
            }
            None => (None, None),
        };
        if cot.is_none() && proto_info.is_none() {
            return Err(CommoError::Parse("protobuf message carries neither event nor control".into()));
        }
        let contact_uid = contact_uid.or_else(|| cot.as_ref().and_then(CoTMessage::contact_uid));
        Ok(Self {
            cot,
            proto_info,
            contact_uid,
            version,
        })
    }

    /// The CoT event, if any.
    pub fn cot_message(&self) -> Option<&CoTMessage> {
        self.cot.as_ref()
    }

    /// Take ownership of the CoT event.
    pub fn into_cot_message(self) -> Option<CoTMessage> {
        self.cot
    }

    /// Advertised protocol range, if any.
    pub fn proto_info(&self) -> Option<TakProtoInfo> {
        self.proto_info
    }

    /// Sender's contact UID: the one carried with the protocol range,
    /// else the one describing the CoT event's contact.
    pub fn contact_uid(&self) -> Option<&ContactUid> {
        self.contact_uid.as_ref()
    }

    /// Protocol version the message arrived with, 0 for XML.
    pub fn proto_version(&self) -> u32 {
        self.version
    }

    /// Serialize as protobuf at `version`.
    pub fn serialize_protobuf(
        &self,
        version: u32,
        header: ProtoHeader,
        include_cot: bool,
        include_proto_info: bool,
    ) -> Result<Vec<u8>> {
        if !(SELF_MIN_PROTO..=SELF_MAX_PROTO).contains(&version) {
            return Err(CommoError::invalid(format!("cannot serialize protocol version {version}")));
        }
        let cot_event = match (&self.cot, include_cot) {
            (Some(cot), true) => Some(cot.to_cot_event()),
            _ => None,
        };
        let tak_control = match (self.proto_info, include_proto_info) {
            (Some(info), true) => Some(takproto::TakControl {
                min_proto_version: info.min,
                max_proto_version: info.max,
                contact_uid: self
                    .contact_uid
                    .as_ref()
                    .map(ContactUid::to_string_lossy)
                    .unwrap_or_default(),
            }),
            _ => None,
        };
        if cot_event.is_none() && tak_control.is_none() {
            return Err(CommoError::invalid("nothing to serialize"));
        }
        let payload = takproto::TakMessage {
            tak_control,
            cot_event,
        }
        .encode_to_vec();

        let mut out = Vec::with_capacity(payload.len() + 8);
        match header {
            ProtoHeader::Mesh => {
                out.push(TAKPROTO_MAGIC);
                encode_varint(u64::from(version), &mut out);
                out.push(TAKPROTO_MAGIC);
            }
            ProtoHeader::Stream => {
                out.push(TAKPROTO_MAGIC);
                encode_varint(payload.len() as u64, &mut out);
            }
            ProtoHeader::None => {}
        }
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Serialize for a mesh peer: XML at version 0, mesh protobuf otherwise.
    pub fn serialize_mesh(&self, version: u32, include_proto_info: bool) -> Result<Vec<u8>> {
        match (&self.cot, version) {
            (Some(cot), LEGACY_PROTO) => Ok(cot.serialize()),
            (_, LEGACY_PROTO) => self.serialize_protobuf(SELF_MIN_PROTO, ProtoHeader::Mesh, true, include_proto_info),
            _ => self.serialize_protobuf(version, ProtoHeader::Mesh, true, include_proto_info),
        }
    }
}

/// Convert CoT XML into a mesh-framed protobuf message at `version`.
pub fn cot_xml_to_takproto(xml: &str, version: u32) -> Result<Vec<u8>> {
    let cot = CoTMessage::parse(xml.as_bytes()).map_err(|e| CommoError::invalid(e.to_string()))?;
    TakMessage::new(Some(cot), None).serialize_protobuf(version, ProtoHeader::Mesh, true, false)
}

/// Convert a mesh-framed message (or legacy XML) into CoT XML.
pub fn takproto_to_cot_xml(data: &[u8]) -> Result<String> {
    let msg = TakMessage::parse_mesh(data).map_err(|e| CommoError::invalid(e.to_string()))?;
    msg.cot_message()
        .map(CoTMessage::to_xml_string)
        .ok_or_else(|| CommoError::invalid("message carries no CoT event"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SA: &str = r#"<event version="2.0" uid="U1" type="a-f-G" how="m-g" time="2024-01-01T00:00:00.000Z" start="2024-01-01T00:00:00.000Z" stale="2024-01-01T00:01:00.000Z"><point lat="1.5" lon="2.5" hae="3" ce="4" le="5"/><detail><contact endpoint="10.1.1.1:4242:tcp" callsign="C1"/><remarks>r</remarks></detail></event>"#;

    #[test]
    fn test_varint_partial() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, hex::decode("ac02").unwrap());
        assert_eq!(decode_varint(&buf), Varint::Complete(300, 2));
        assert_eq!(decode_varint(&buf[..1]), Varint::Incomplete);
        assert_eq!(decode_varint(&[]), Varint::Incomplete);
        assert_eq!(decode_varint(&[0xff; 11]), Varint::Invalid);
    }

    #[test]
    fn test_mesh_header_layout() {
        let cot = CoTMessage::parse(SA.as_bytes()).unwrap();
        let uid = ContactUid::from("me");
        let bytes = TakMessage::new(Some(cot), Some(&uid))
            .serialize_mesh(1, true)
            .unwrap();
        assert_eq!(&bytes[..3], &[0xbf, 0x01, 0xbf]);

        let parsed = TakMessage::parse_mesh(&bytes).unwrap();
        assert_eq!(parsed.proto_version(), 1);
        assert_eq!(parsed.proto_info(), Some(TakProtoInfo::new(1, 1)));
        assert_eq!(parsed.contact_uid(), Some(&uid));
        let cot = parsed.cot_message().unwrap();
        assert_eq!(cot.callsign(), "C1");
        assert_eq!(cot.point().lat, 1.5);
    }

    #[test]
    fn test_stream_header_length() {
        let cot = CoTMessage::parse(SA.as_bytes()).unwrap();
        let bytes = TakMessage::new(Some(cot), None)
            .serialize_protobuf(1, ProtoHeader::Stream, true, false)
            .unwrap();
        assert_eq!(bytes[0], TAKPROTO_MAGIC);
        let Varint::Complete(len, used) = decode_varint(&bytes[1..]) else {
            panic!("bad length");
        };
        assert_eq!(len as usize, bytes.len() - 1 - used);
        let parsed = TakMessage::parse_protobuf(&bytes[1 + used..], 1).unwrap();
        assert!(parsed.proto_info().is_none());
        assert_eq!(parsed.contact_uid(), Some(&ContactUid::from("U1")));
        assert_eq!(parsed.proto_version(), 1);
    }

    #[test]
    fn test_legacy_is_xml() {
        let cot = CoTMessage::parse(SA.as_bytes()).unwrap();
        let bytes = TakMessage::new(Some(cot), None).serialize_mesh(0, false).unwrap();
        assert!(bytes.starts_with(b"<?xml"));
        assert!(TakMessage::parse_mesh(&bytes).unwrap().cot_message().is_some());
    }

    #[test]
    fn test_version_only() {
        let uid = ContactUid::from("me");
        let bytes = TakMessage::new(None, Some(&uid)).serialize_mesh(0, true).unwrap();
        let parsed = TakMessage::parse_mesh(&bytes).unwrap();
        assert!(parsed.cot_message().is_none());
        assert_eq!(parsed.proto_info(), Some(TakProtoInfo::local()));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = vec![0xbf, 0x05, 0xbf];
        bytes.extend_from_slice(b"junk");
        assert!(TakMessage::parse_mesh(&bytes).is_err());
        assert!(TakMessage::parse_mesh(&[0xbf, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_facade_conversions() {
        let proto = cot_xml_to_takproto(SA, 1).unwrap();
        let xml = takproto_to_cot_xml(&proto).unwrap();
        assert!(xml.contains(r#"callsign="C1""#));
        assert!(xml.contains("<remarks>r</remarks>"));
        assert!(cot_xml_to_takproto(SA, 7).is_err());
        assert!(cot_xml_to_takproto("<nope/>", 1).is_err());
    }
}
