//! CoT event messages.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use tracing::debug;

use super::takproto;
use super::time::{cot_time_from_now, format_cot_time, from_millis, parse_cot_millis};
use super::xml::{XmlElement, XmlNode, parse_document, parse_fragment, write_node};
use crate::core::constants::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, FILE_XFER_STALE};
use crate::core::{CoTMessageType, CoTPointData, CommoError, ContactUid, EndpointType, Result};

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

const TYPE_TAKP_SUPPORT: &str = "t-x-takp-v";
const TYPE_TAKP_REQUEST: &str = "t-x-takp-q";
const TYPE_TAKP_RESPONSE: &str = "t-x-takp-r";
const HOW_TAKCONTROL: &str = "m-g";
const STALE_TAKCONTROL: Duration = Duration::from_secs(60);

const TYPE_FILE_REQ: &str = "b-f-t-r";
const HOW_FILE_REQ: &str = "h-e";
const TYPE_FILE_ACK: &str = "b-f-t-a";
const HOW_FILE_ACK: &str = "m-g";

const TYPE_PING: &str = "t-x-c-t";
const TYPE_PONG: &str = "t-x-c-t-r";
const HOW_PING: &str = "m-g";
const STALE_PING: Duration = Duration::from_secs(10);

/// Endpoint string carried by messages relayed through a TAK server.
pub const STREAMING_ENDPOINT: &str = "*:-1:stcp";
const TCP_USESRC_ENDPOINT: &str = "tcpsrcreply";
const UDP_USESRC_ENDPOINT: &str = "udpsrcreply";

/// Kinds of TAK protocol control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakControlType {
    /// Server advertises supported versions.
    Support,
    /// Client asks to switch versions.
    Request,
    /// Server answers a request.
    Response,
}

/// A file transfer offer carried in `<fileshare>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferRequest {
    /// Hex SHA-256 of the file.
    pub sha256: String,
    /// Transfer name.
    pub name: String,
    /// File name the sender wants used.
    pub sender_filename: String,
    /// URL to download from.
    pub sender_url: String,
    /// File size.
    pub size_in_bytes: u64,
    /// Sender callsign.
    pub sender_callsign: String,
    /// Sender contact UID.
    pub sender_uid: ContactUid,
    /// Ack UID, empty if no ack is requested.
    pub ack_uid: String,
    /// True if the sender hosts the file itself.
    pub peer_hosted: bool,
    /// Sender's https port for peer-hosted transfers.
    pub https_port: Option<u16>,
}

/// A file transfer acknowledgement carried in `<ackresponse>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferAck {
    /// Ack UID from the original request.
    pub uid: String,
    /// UID of the receiver sending the ack.
    pub sender_uid: String,
    /// Whether the transfer succeeded.
    pub success: bool,
    /// Human readable reason.
    pub reason: String,
    /// Bytes received.
    pub size_in_bytes: u64,
}

/// A parsed CoT event.
///
/// The `<detail>` element is always present. `_flow-tags_` inserted by
/// servers are stripped at parse time.
#[derive(Debug, Clone, PartialEq)]
pub struct CoTMessage {
    event: XmlElement,
    detail: XmlElement,
    time_ms: i64,
    start_ms: i64,
    stale_ms: i64,
    point: CoTPointData,
    xfer_req: Option<FileTransferRequest>,
}

impl CoTMessage {
    /// Parse an XML CoT document.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut event = parse_document(data)?;
        if event.name != "event" {
            return Err(CommoError::Parse("invalid root node for CoT message".into()));
        }
        if !event.has_attr("uid") {
            return Err(CommoError::Parse("missing uid in CoT event".into()));
        }
        let required = |name: &str| {
            event
                .attr(name)
                .map(str::to_string)
                .ok_or_else(|| CommoError::Parse(format!("missing CoT event attribute {name}")))
        };
        required("how")?;
        required("type")?;
        let time_ms = parse_cot_millis(&required("time")?)?;
        let start_ms = parse_cot_millis(&required("start")?)?;
        let stale_ms = parse_cot_millis(&required("stale")?)?;
        let point_el = event
            .child("point")
            .ok_or_else(|| CommoError::Parse("missing CoT point".into()))?;
        let point = parse_point(point_el)?;

        let detail = event.take_child("detail").unwrap_or_else(|| XmlElement::new("detail"));
        event.remove_children("detail");
        Ok(Self::assemble(event, detail, time_ms, start_ms, stale_ms, point))
    }

    fn assemble(
        event: XmlElement,
        mut detail: XmlElement,
        time_ms: i64,
        start_ms: i64,
        stale_ms: i64,
        point: CoTPointData,
    ) -> Self {
        detail.remove_children("_flow-tags_");
        let xfer_req = detail.child("fileshare").and_then(|fs| parse_fileshare(fs, &detail));
        Self {
            event,
            detail,
            time_ms,
            start_ms,
            stale_ms,
            point,
            xfer_req,
        }
    }

    fn build(uid: &str, cot_type: &str, how: &str, stale: Duration, point: CoTPointData) -> Self {
        let now = cot_time_from_now(Duration::ZERO);
        let stale_at = cot_time_from_now(stale);
        Self::build_at(
            uid,
            cot_type,
            how,
            now.timestamp_millis(),
            now.timestamp_millis(),
            stale_at.timestamp_millis(),
            point,
            XmlElement::new("detail"),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_at(
        uid: &str,
        cot_type: &str,
        how: &str,
        time_ms: i64,
        start_ms: i64,
        stale_ms: i64,
        point: CoTPointData,
        detail: XmlElement,
    ) -> Self {
        let point_el = XmlElement::new("point")
            .with_attr("lat", format_double(point.lat))
            .with_attr("lon", format_double(point.lon))
            .with_attr("hae", format_double(point.hae))
            .with_attr("ce", format_double(point.ce))
            .with_attr("le", format_double(point.le));
        let event = XmlElement::new("event")
            .with_attr("version", "2.0")
            .with_attr("uid", uid)
            .with_attr("type", cot_type)
            .with_attr("time", format_cot_time(&from_millis(time_ms)))
            .with_attr("start", format_cot_time(&from_millis(start_ms)))
            .with_attr("stale", format_cot_time(&from_millis(stale_ms)))
            .with_attr("how", how)
            .with_child(point_el);
        Self::assemble(event, detail, time_ms, start_ms, stale_ms, point)
    }

    /// A keep-alive ping for streaming connections.
    pub fn ping(uid: &str) -> Self {
        Self::build(uid, TYPE_PING, HOW_PING, STALE_PING, zero_point())
    }

    /// A TAK-control request to switch to protocol `version`.
    pub fn tak_control_request(uid: &str, version: u32) -> Self {
        let mut msg = Self::build(uid, TYPE_TAKP_REQUEST, HOW_TAKCONTROL, STALE_TAKCONTROL, zero_point());
        let request = XmlElement::new("TakRequest").with_attr("version", version.to_string());
        msg.detail.add_child(XmlElement::new("TakControl").with_child(request));
        msg
    }

    /// A file transfer offer.
    pub fn new_file_transfer_request(uid: &str, point: CoTPointData, req: &FileTransferRequest) -> Self {
        let mut msg = Self::build(uid, TYPE_FILE_REQ, HOW_FILE_REQ, FILE_XFER_STALE, point);
        let mut fs = XmlElement::new("fileshare")
            .with_attr("filename", req.sender_filename.as_str())
            .with_attr("senderUrl", req.sender_url.as_str())
            .with_attr("sizeInBytes", req.size_in_bytes.to_string())
            .with_attr("sha256", req.sha256.as_str())
            .with_attr("senderUid", req.sender_uid.to_string_lossy())
            .with_attr("senderCallsign", req.sender_callsign.as_str())
            .with_attr("name", req.name.as_str());
        if req.peer_hosted {
            fs.set_attr("peerHosted", "true");
            if let Some(port) = req.https_port {
                fs.set_attr("httpsPort", port.to_string());
            }
        }
        msg.detail.add_child(fs);
        if !req.ack_uid.is_empty() {
            msg.detail.add_child(
                XmlElement::new("ackrequest")
                    .with_attr("uid", req.ack_uid.as_str())
                    .with_attr("ackrequested", "true")
                    .with_attr("tag", req.name.as_str()),
            );
        }
        msg.xfer_req = Some(req.clone());
        msg
    }

    /// Acknowledgement of a file transfer offer.
    pub fn new_file_transfer_ack(
        uid: &str,
        point: CoTPointData,
        req: &FileTransferRequest,
        receiver_uid: &ContactUid,
        failed: bool,
        reason: &str,
    ) -> Self {
        let mut msg = Self::build(uid, TYPE_FILE_ACK, HOW_FILE_ACK, FILE_XFER_STALE, point);
        msg.detail.add_child(
            XmlElement::new("ackresponse")
                .with_attr("uid", req.ack_uid.as_str())
                .with_attr("senderUid", receiver_uid.to_string_lossy())
                .with_attr("success", if failed { "false" } else { "true" })
                .with_attr("tag", req.name.as_str())
                .with_attr("reason", reason)
                .with_attr("sha256", req.sha256.as_str())
                .with_attr("sizeInBytes", req.size_in_bytes.to_string()),
        );
        msg
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The event `uid` attribute.
    pub fn event_uid(&self) -> &str {
        self.event.attr("uid").unwrap_or_default()
    }

    /// The event `type` attribute.
    pub fn cot_type(&self) -> &str {
        self.event.attr("type").unwrap_or_default()
    }

    /// The event `how` attribute.
    pub fn how(&self) -> &str {
        self.event.attr("how").unwrap_or_default()
    }

    /// Chat if the detail holds a `__chat` element.
    pub fn message_type(&self) -> CoTMessageType {
        if self.detail.child("__chat").is_some() {
            CoTMessageType::Chat
        } else {
            CoTMessageType::SituationalAwareness
        }
    }

    /// The event point.
    pub fn point(&self) -> CoTPointData {
        self.point
    }

    /// The `<detail>` element.
    pub fn detail(&self) -> &XmlElement {
        &self.detail
    }

    /// UID of the contact this message describes.
    ///
    /// Only messages with a `<contact>` element describe a contact. File
    /// transfer acks are excluded because some senders put the UID in the
    /// callsign field.
    pub fn contact_uid(&self) -> Option<ContactUid> {
        if self.contact().is_some() && self.detail.child("ackresponse").is_none() {
            Some(ContactUid::from(self.event_uid()))
        } else {
            None
        }
    }

    fn contact(&self) -> Option<&XmlElement> {
        self.detail.child("contact")
    }

    /// Callsign from the contact element, empty if absent.
    pub fn callsign(&self) -> &str {
        self.contact()
            .and_then(|c| c.attr("callsign"))
            .unwrap_or_default()
    }

    /// Raw `contact@endpoint`, empty if absent.
    pub fn endpoint_string(&self) -> &str {
        self.contact()
            .and_then(|c| c.attr("endpoint"))
            .unwrap_or_default()
    }

    /// Host part of the endpoint.
    pub fn endpoint_host(&self) -> &str {
        let ep = self.endpoint_string();
        ep.split_once(':').map_or(ep, |(host, _)| host)
    }

    /// Port part of the endpoint, if present and numeric.
    pub fn endpoint_port(&self) -> Option<i32> {
        let mut parts = self.endpoint_string().splitn(3, ':');
        parts.next()?;
        let port = parts.next()?;
        parts.next()?;
        port.trim().parse().ok()
    }

    /// Protocol part of the endpoint.
    pub fn endpoint_type(&self) -> EndpointType {
        let mut parts = self.endpoint_string().splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(_), Some(proto)) => match proto {
                "udp" => EndpointType::Udp,
                "tcp" => EndpointType::Tcp,
                "stcp" => EndpointType::Streaming,
                "srctcp" => EndpointType::TcpUseSrc,
                "srcudp" => EndpointType::UdpUseSrc,
                _ => EndpointType::None,
            },
            _ => EndpointType::None,
        }
    }

    /// The TAK-control kind, if this is a control message.
    pub fn tak_control_type(&self) -> Option<TakControlType> {
        match self.cot_type() {
            TYPE_TAKP_SUPPORT => Some(TakControlType::Support),
            TYPE_TAKP_REQUEST => Some(TakControlType::Request),
            TYPE_TAKP_RESPONSE => Some(TakControlType::Response),
            _ => None,
        }
    }

    /// Versions listed in `TakControl/TakProtocolSupport@version`.
    pub fn tak_control_supported_versions(&self) -> BTreeSet<u32> {
        let Some(control) = self.detail.child("TakControl") else {
            return BTreeSet::new();
        };
        control
            .elements()
            .filter(|e| e.name == "TakProtocolSupport")
            .filter_map(|e| {
                let v = e.attr("version").and_then(|v| v.trim().parse().ok());
                if v.is_none() {
                    debug!("TakProtocolSupport version missing or invalid");
                }
                v
            })
            .collect()
    }

    /// True if `TakControl/TakResponse@status` is `true`.
    pub fn tak_control_response_status(&self) -> bool {
        self.detail
            .child("TakControl")
            .and_then(|c| c.child("TakResponse"))
            .and_then(|r| r.attr("status"))
            == Some("true")
    }

    /// True for a server ping reply.
    pub fn is_pong(&self) -> bool {
        self.cot_type() == TYPE_PONG
    }

    /// The file transfer offer, if this message carries one.
    pub fn file_transfer_request(&self) -> Option<&FileTransferRequest> {
        self.xfer_req.as_ref()
    }

    /// The file transfer acknowledgement, if this message carries one.
    pub fn file_transfer_ack(&self) -> Option<FileTransferAck> {
        let ack = self.detail.child("ackresponse")?;
        let s = |name: &str| ack.attr(name).unwrap_or_default().to_string();
        Some(FileTransferAck {
            uid: s("uid"),
            sender_uid: s("senderUid"),
            success: ack.attr("success") == Some("true"),
            reason: s("reason"),
            size_in_bytes: ack
                .attr("sizeInBytes")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
        })
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Rewrite the advertised endpoint.
    ///
    /// The contact endpoint is only rewritten if the message already carries
    /// one; an ack request endpoint is always written.
    pub fn set_endpoint(&mut self, ep_type: EndpointType, host: &str) {
        let ep = match ep_type {
            EndpointType::UdpUseSrc => format!("{UDP_USESRC_ENDPOINT}:{DEFAULT_UDP_PORT}:srcudp"),
            EndpointType::TcpUseSrc => format!("{TCP_USESRC_ENDPOINT}:{DEFAULT_TCP_PORT}:srctcp"),
            EndpointType::Udp if !host.is_empty() => format!("{host}:{DEFAULT_UDP_PORT}:udp"),
            EndpointType::Tcp if !host.is_empty() => format!("{host}:{DEFAULT_TCP_PORT}:tcp"),
            EndpointType::Streaming => STREAMING_ENDPOINT.to_string(),
            _ => String::new(),
        };
        if let Some(contact) = self.detail.child_mut("contact") {
            if contact.has_attr("endpoint") {
                set_endpoint_attr(contact, &ep);
            }
        }
        if let Some(ackreq) = self.detail.child_mut("ackrequest") {
            set_endpoint_attr(ackreq, &ep);
        }
    }

    /// Address the message to specific callsigns on a TAK server.
    ///
    /// An empty list removes any addressing so the server sends to all.
    pub fn set_tak_server_recipients(&mut self, callsigns: &[String]) {
        if callsigns.is_empty() {
            self.detail.remove_children("marti");
            return;
        }
        let marti = self.detail.child_or_insert("marti");
        marti.children.clear();
        for cs in callsigns {
            marti.add_child(XmlElement::new("dest").with_attr("callsign", cs.as_str()));
        }
    }

    /// Address the message to a TAK server mission.
    pub fn set_tak_server_mission_recipient(&mut self, mission: &str) {
        let marti = self.detail.child_or_insert("marti");
        marti.children.clear();
        marti.add_child(XmlElement::new("dest").with_attr("mission", mission));
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Compact XML document, without trailing newline.
    pub fn to_xml_string(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str(XML_DECL);
        self.event.write_start(&mut out);
        out.push('>');
        for child in &self.event.children {
            write_node(child, &mut out);
        }
        self.detail.write_to(&mut out);
        out.push_str("</event>");
        out
    }

    /// Compact XML document as bytes.
    pub fn serialize(&self) -> Vec<u8> {
        self.to_xml_string().into_bytes()
    }

    /// Convert to the protobuf event representation.
    pub fn to_cot_event(&self) -> takproto::CotEvent {
        let attr = |name: &str| self.event.attr(name).unwrap_or_default().to_string();
        let mut ev = takproto::CotEvent {
            r#type: attr("type"),
            access: attr("access"),
            qos: attr("qos"),
            opex: attr("opex"),
            uid: attr("uid"),
            send_time: self.time_ms.max(0) as u64,
            start_time: self.start_ms.max(0) as u64,
            stale_time: self.stale_ms.max(0) as u64,
            how: attr("how"),
            lat: self.point.lat,
            lon: self.point.lon,
            hae: self.point.hae,
            ce: self.point.ce,
            le: self.point.le,
            detail: None,
        };

        let mut rest = self.detail.clone();
        let mut detail = takproto::Detail::default();
        let mut has_detail = false;

        detail.contact = lift(&mut rest, "contact", |el| {
            let endpoint = el.remove_attr("endpoint").unwrap_or_default();
            let callsign = el.remove_attr("callsign")?;
            Some(takproto::Contact { endpoint, callsign })
        });
        detail.group = lift(&mut rest, "__group", |el| {
            Some(takproto::Group {
                name: el.remove_attr("name")?,
                role: el.remove_attr("role")?,
            })
        });
        detail.precision_location = lift(&mut rest, "precisionlocation", |el| {
            Some(takproto::PrecisionLocation {
                geopointsrc: el.remove_attr("geopointsrc")?,
                altsrc: el.remove_attr("altsrc")?,
            })
        });
        detail.status = lift(&mut rest, "status", |el| {
            let battery = el.remove_attr("battery")?.trim().parse::<i32>().ok()?;
            Some(takproto::Status {
                battery: u32::try_from(battery).ok()?,
            })
        });
        detail.takv = lift(&mut rest, "takv", |el| {
            Some(takproto::Takv {
                device: el.remove_attr("device")?,
                platform: el.remove_attr("platform")?,
                os: el.remove_attr("os")?,
                version: el.remove_attr("version")?,
            })
        });
        detail.track = lift(&mut rest, "track", |el| {
            Some(takproto::Track {
                speed: el.remove_attr("speed")?.trim().parse().ok()?,
                course: el.remove_attr("course")?.trim().parse().ok()?,
            })
        });
        has_detail |= detail.contact.is_some()
            || detail.group.is_some()
            || detail.precision_location.is_some()
            || detail.status.is_some()
            || detail.takv.is_some()
            || detail.track.is_some();

        let mut xml_detail = String::new();
        for child in &rest.children {
            write_node(child, &mut xml_detail);
        }
        if !xml_detail.is_empty() {
            detail.xml_detail = xml_detail;
            has_detail = true;
        }
        if has_detail {
            ev.detail = Some(detail);
        }
        ev
    }

    /// Build a message from its protobuf event representation.
    pub fn from_cot_event(ev: &takproto::CotEvent) -> Result<Self> {
        let mut detail = XmlElement::new("detail");
        if let Some(d) = &ev.detail {
            if !d.xml_detail.is_empty() {
                detail.children = parse_fragment(&d.xml_detail)?;
            }
            if let Some(c) = &d.contact {
                restore(&mut detail, "contact", || {
                    let mut el = XmlElement::new("contact");
                    if !c.endpoint.is_empty() {
                        el.set_attr("endpoint", c.endpoint.as_str());
                    }
                    el.with_attr("callsign", c.callsign.as_str())
                });
            }
            if let Some(g) = &d.group {
                restore(&mut detail, "__group", || {
                    XmlElement::new("__group")
                        .with_attr("name", g.name.as_str())
                        .with_attr("role", g.role.as_str())
                });
            }
            if let Some(p) = &d.precision_location {
                restore(&mut detail, "precisionlocation", || {
                    XmlElement::new("precisionlocation")
                        .with_attr("geopointsrc", p.geopointsrc.as_str())
                        .with_attr("altsrc", p.altsrc.as_str())
                });
            }
            if let Some(s) = &d.status {
                restore(&mut detail, "status", || {
                    XmlElement::new("status").with_attr("battery", s.battery.min(i32::MAX as u32).to_string())
                });
            }
            if let Some(t) = &d.takv {
                restore(&mut detail, "takv", || {
                    XmlElement::new("takv")
                        .with_attr("device", t.device.as_str())
                        .with_attr("platform", t.platform.as_str())
                        .with_attr("os", t.os.as_str())
                        .with_attr("version", t.version.as_str())
                });
            }
            if let Some(t) = &d.track {
                restore(&mut detail, "track", || {
                    XmlElement::new("track")
                        .with_attr("speed", format_double(t.speed))
                        .with_attr("course", format_double(t.course))
                });
            }
        }

        let point = CoTPointData::new(ev.lat, ev.lon, ev.hae, ev.ce, ev.le);
        let millis = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        let mut msg = Self::build_at(
            &ev.uid,
            &ev.r#type,
            &ev.how,
            millis(ev.send_time),
            millis(ev.start_time),
            millis(ev.stale_time),
            point,
            detail,
        );
        for (name, value) in [("access", &ev.access), ("qos", &ev.qos), ("opex", &ev.opex)] {
            if !value.is_empty() {
                msg.event.set_attr(name, value.as_str());
            }
        }
        Ok(msg)
    }
}

impl fmt::Display for CoTMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml_string())
    }
}

fn zero_point() -> CoTPointData {
    CoTPointData::new(0.0, 0.0, 0.0, CoTPointData::NO_VALUE, CoTPointData::NO_VALUE)
}

fn format_double(v: f64) -> String {
    format!("{v}")
}

fn parse_point(el: &XmlElement) -> Result<CoTPointData> {
    let get = |name: &str| -> Result<f64> {
        el.attr(name)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .ok_or_else(|| CommoError::Parse(format!("missing or invalid point attribute {name}")))
    };
    Ok(CoTPointData::new(get("lat")?, get("lon")?, get("hae")?, get("ce")?, get("le")?))
}

fn parse_fileshare(fs: &XmlElement, detail: &XmlElement) -> Option<FileTransferRequest> {
    let s = |name: &str| fs.attr(name).map(str::to_string);
    let ack_uid = detail
        .child("ackrequest")
        .filter(|a| a.attr("ackrequested") == Some("true"))
        .and_then(|a| a.attr("uid"))
        .unwrap_or_default()
        .to_string();
    Some(FileTransferRequest {
        sha256: s("sha256")?,
        name: s("name")?,
        sender_filename: s("filename")?,
        sender_url: s("senderUrl")?,
        size_in_bytes: fs
            .attr("sizeInBytes")?
            .trim()
            .parse()
            .unwrap_or(0),
        sender_callsign: s("senderCallsign")?,
        sender_uid: ContactUid::from(fs.attr("senderUid")?),
        ack_uid,
        peer_hosted: fs.attr("peerHosted") == Some("true"),
        https_port: fs.attr("httpsPort").and_then(|p| p.trim().parse().ok()),
    })
}

fn set_endpoint_attr(el: &mut XmlElement, ep: &str) {
    if ep.is_empty() {
        el.remove_attr("endpoint");
    } else {
        el.set_attr("endpoint", ep);
    }
}

/// Move a single, fully mapped detail element into a protobuf field.
///
/// The element stays in the XML remainder if it repeats, has children, or
/// carries attributes the mapping does not consume.
fn lift<T>(rest: &mut XmlElement, name: &str, map: impl FnOnce(&mut XmlElement) -> Option<T>) -> Option<T> {
    if rest.count_children(name) != 1 {
        return None;
    }
    let mut el = rest.child(name)?.clone();
    if !el.children.is_empty() {
        debug!(element = name, "unmapped children, keeping as xml detail");
        return None;
    }
    let mapped = map(&mut el)?;
    if !el.attrs.is_empty() {
        debug!(element = name, "unmapped attributes, keeping as xml detail");
        return None;
    }
    rest.remove_children(name);
    Some(mapped)
}

fn restore(detail: &mut XmlElement, name: &str, build: impl FnOnce() -> XmlElement) {
    if detail.child(name).is_none() {
        detail.children.push(XmlNode::Element(build()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SA: &str = r#"<?xml version="1.0" standalone="yes"?><event version="2.0" uid="ANDROID-1" type="a-f-G-U-C" how="h-e" time="2024-01-01T00:00:00.000Z" start="2024-01-01T00:00:00.000Z" stale="2024-01-01T00:02:00.000Z"><point lat="38.1" lon="-77.2" hae="10" ce="9999999" le="9999999"/><detail><contact endpoint="192.168.1.5:4242:tcp" callsign="ALPHA"/><__group name="Cyan" role="Team Member"/><takv device="Pixel" platform="ATAK-CIV" os="34" version="5.0"/><_flow-tags_ a="b"/><remarks>hello</remarks></detail></event>"#;

    #[test]
    fn test_parse_sa() {
        let msg = CoTMessage::parse(SA.as_bytes()).unwrap();
        assert_eq!(msg.event_uid(), "ANDROID-1");
        assert_eq!(msg.contact_uid(), Some(ContactUid::from("ANDROID-1")));
        assert_eq!(msg.callsign(), "ALPHA");
        assert_eq!(msg.endpoint_host(), "192.168.1.5");
        assert_eq!(msg.endpoint_port(), Some(4242));
        assert_eq!(msg.endpoint_type(), EndpointType::Tcp);
        assert_eq!(msg.message_type(), CoTMessageType::SituationalAwareness);
        assert!(msg.detail().child("_flow-tags_").is_none());
        assert_eq!(msg.point().lat, 38.1);
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert!(CoTMessage::parse(b"<event uid='x'/>").is_err());
        assert!(CoTMessage::parse(b"<notevent/>").is_err());
        let no_point = SA.replace(r#"<point lat="38.1" lon="-77.2" hae="10" ce="9999999" le="9999999"/>"#, "");
        assert!(CoTMessage::parse(no_point.as_bytes()).is_err());
    }

    #[test]
    fn test_missing_detail_created() {
        let xml = r#"<event uid="u" type="a" how="m-g" time="2024-01-01T00:00:00Z" start="2024-01-01T00:00:00Z" stale="2024-01-01T00:00:10Z"><point lat="0" lon="0" hae="0" ce="0" le="0"/></event>"#;
        let msg = CoTMessage::parse(xml.as_bytes()).unwrap();
        assert!(msg.to_xml_string().ends_with("<detail/></event>"));
        assert!(msg.contact_uid().is_none());
    }

    #[test]
    fn test_chat_type() {
        let xml = SA.replace("<remarks>", "<__chat id=\"x\"/><remarks>");
        let msg = CoTMessage::parse(xml.as_bytes()).unwrap();
        assert_eq!(msg.message_type(), CoTMessageType::Chat);
    }

    #[test]
    fn test_set_endpoint() {
        let mut msg = CoTMessage::parse(SA.as_bytes()).unwrap();
        msg.set_endpoint(EndpointType::Udp, "10.0.0.1");
        assert_eq!(msg.endpoint_string(), "10.0.0.1:6969:udp");
        msg.set_endpoint(EndpointType::TcpUseSrc, "");
        assert_eq!(msg.endpoint_string(), "tcpsrcreply:4242:srctcp");
        msg.set_endpoint(EndpointType::Streaming, "");
        assert_eq!(msg.endpoint_string(), STREAMING_ENDPOINT);
        msg.set_endpoint(EndpointType::None, "");
        assert_eq!(msg.endpoint_string(), "");
        // no longer present, so never re-added
        msg.set_endpoint(EndpointType::Udp, "10.0.0.1");
        assert_eq!(msg.endpoint_string(), "");
    }

    #[test]
    fn test_server_recipients() {
        let mut msg = CoTMessage::parse(SA.as_bytes()).unwrap();
        msg.set_tak_server_recipients(&["A".into(), "B".into()]);
        let marti = msg.detail().child("marti").unwrap();
        assert_eq!(marti.count_children("dest"), 2);
        msg.set_tak_server_mission_recipient("m1");
        let marti = msg.detail().child("marti").unwrap();
        assert_eq!(marti.child("dest").unwrap().attr("mission"), Some("m1"));
        msg.set_tak_server_recipients(&[]);
        assert!(msg.detail().child("marti").is_none());
    }

    #[test]
    fn test_tak_control() {
        let req = CoTMessage::tak_control_request("me", 1);
        assert_eq!(req.tak_control_type(), Some(TakControlType::Request));
        assert!(req.to_xml_string().contains(r#"<TakControl><TakRequest version="1"/></TakControl>"#));

        let support = r#"<event version="2.0" uid="protouid" type="t-x-takp-v" time="2024-01-01T00:00:00Z" start="2024-01-01T00:00:00Z" stale="2024-01-01T00:01:00Z" how="m-g"><point lat="0" lon="0" hae="0" ce="9999999" le="9999999"/><detail><TakControl><TakProtocolSupport version="1"/><TakProtocolSupport version="2"/></TakControl></detail></event>"#;
        let msg = CoTMessage::parse(support.as_bytes()).unwrap();
        assert_eq!(msg.tak_control_type(), Some(TakControlType::Support));
        assert_eq!(msg.tak_control_supported_versions().into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let resp = support
            .replace("t-x-takp-v", "t-x-takp-r")
            .replace(r#"<TakProtocolSupport version="1"/><TakProtocolSupport version="2"/>"#, r#"<TakResponse status="true"/>"#);
        let msg = CoTMessage::parse(resp.as_bytes()).unwrap();
        assert!(msg.tak_control_response_status());
    }

    #[test]
    fn test_ping() {
        let ping = CoTMessage::ping("me-ping");
        assert_eq!(ping.cot_type(), "t-x-c-t");
        assert!(!ping.is_pong());
        let reparsed = CoTMessage::parse(&ping.serialize()).unwrap();
        assert_eq!(reparsed.event_uid(), "me-ping");
        assert_eq!(reparsed.point().hae, 0.0);
        assert_eq!(reparsed.point().ce, CoTPointData::NO_VALUE);
    }

    #[test]
    fn test_file_transfer_messages() {
        let req = FileTransferRequest {
            sha256: "abc".into(),
            name: "pkg".into(),
            sender_filename: "pkg.zip".into(),
            sender_url: "http://1.2.3.4:8080/getfile?file=1".into(),
            size_in_bytes: 42,
            sender_callsign: "ALPHA".into(),
            sender_uid: ContactUid::from("me"),
            ack_uid: "ack-1".into(),
            peer_hosted: true,
            https_port: Some(8443),
        };
        let msg = CoTMessage::new_file_transfer_request("xfer-1", CoTPointData::default(), &req);
        let parsed = CoTMessage::parse(&msg.serialize()).unwrap();
        assert_eq!(parsed.file_transfer_request(), Some(&req));

        let ack = CoTMessage::new_file_transfer_ack("ack-msg", CoTPointData::default(), &req, &ContactUid::from("them"), false, "ok");
        let parsed = CoTMessage::parse(&ack.serialize()).unwrap();
        let a = parsed.file_transfer_ack().unwrap();
        assert_eq!(a.uid, "ack-1");
        assert_eq!(a.sender_uid, "them");
        assert!(a.success);
        assert_eq!(a.size_in_bytes, 42);
    }

    #[test]
    fn test_protobuf_lifts_known_elements() {
        let msg = CoTMessage::parse(SA.as_bytes()).unwrap();
        let ev = msg.to_cot_event();
        let detail = ev.detail.as_ref().unwrap();
        assert_eq!(detail.contact.as_ref().unwrap().callsign, "ALPHA");
        assert_eq!(detail.group.as_ref().unwrap().role, "Team Member");
        assert_eq!(detail.takv.as_ref().unwrap().device, "Pixel");
        assert_eq!(detail.xml_detail, "<remarks>hello</remarks>");

        let back = CoTMessage::from_cot_event(&ev).unwrap();
        assert_eq!(back.callsign(), "ALPHA");
        assert_eq!(back.endpoint_type(), EndpointType::Tcp);
        assert!(back.detail().child("remarks").is_some());
    }

    #[test]
    fn test_protobuf_keeps_unmapped() {
        let xml = SA.replace(r#"<__group name="Cyan" role="Team Member"/>"#, r#"<__group name="Cyan" role="Team Member" extra="1"/>"#);
        let msg = CoTMessage::parse(xml.as_bytes()).unwrap();
        let ev = msg.to_cot_event();
        let detail = ev.detail.unwrap();
        assert!(detail.group.is_none());
        assert!(detail.xml_detail.contains("extra=\"1\""));
    }
}
