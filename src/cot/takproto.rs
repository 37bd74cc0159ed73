//! TAK protocol version 1 protobuf messages.
//!
//! Leaf message fields carry the XML attribute of the same name.

#![allow(missing_docs)]

/// Outer message of every protobuf-framed transmission.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TakMessage {
    /// Protocol control information.
    #[prost(message, optional, tag = "1")]
    pub tak_control: Option<TakControl>,
    /// The CoT event, if any.
    #[prost(message, optional, tag = "2")]
    pub cot_event: Option<CotEvent>,
}

/// Protocol support advertisement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TakControl {
    /// Lowest supported version.
    #[prost(uint32, tag = "1")]
    pub min_proto_version: u32,
    /// Highest supported version.
    #[prost(uint32, tag = "2")]
    pub max_proto_version: u32,
    /// Sender's contact UID.
    #[prost(string, tag = "3")]
    pub contact_uid: String,
}

/// A CoT event in protobuf form.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CotEvent {
    /// Event type.
    #[prost(string, tag = "1")]
    pub r#type: String,
    /// Optional access attribute.
    #[prost(string, tag = "2")]
    pub access: String,
    /// Optional qos attribute.
    #[prost(string, tag = "3")]
    pub qos: String,
    /// Optional opex attribute.
    #[prost(string, tag = "4")]
    pub opex: String,
    /// Event UID.
    #[prost(string, tag = "5")]
    pub uid: String,
    /// `time` in POSIX milliseconds.
    #[prost(uint64, tag = "6")]
    pub send_time: u64,
    /// `start` in POSIX milliseconds.
    #[prost(uint64, tag = "7")]
    pub start_time: u64,
    /// `stale` in POSIX milliseconds.
    #[prost(uint64, tag = "8")]
    pub stale_time: u64,
    /// Event how.
    #[prost(string, tag = "9")]
    pub how: String,
    /// Latitude.
    #[prost(double, tag = "10")]
    pub lat: f64,
    /// Longitude.
    #[prost(double, tag = "11")]
    pub lon: f64,
    /// Height above ellipsoid.
    #[prost(double, tag = "12")]
    pub hae: f64,
    /// Circular error.
    #[prost(double, tag = "13")]
    pub ce: f64,
    /// Linear error.
    #[prost(double, tag = "14")]
    pub le: f64,
    /// Detail section.
    #[prost(message, optional, tag = "15")]
    pub detail: Option<Detail>,
}

/// Event detail with commonly used elements lifted out.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Detail {
    /// Remaining detail children as XML.
    #[prost(string, tag = "1")]
    pub xml_detail: String,
    #[prost(message, optional, tag = "2")]
    pub contact: Option<Contact>,
    #[prost(message, optional, tag = "3")]
    pub group: Option<Group>,
    #[prost(message, optional, tag = "4")]
    pub precision_location: Option<PrecisionLocation>,
    #[prost(message, optional, tag = "5")]
    pub status: Option<Status>,
    #[prost(message, optional, tag = "6")]
    pub takv: Option<Takv>,
    #[prost(message, optional, tag = "7")]
    pub track: Option<Track>,
}

/// `<contact>`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Contact {
    #[prost(string, tag = "1")]
    pub endpoint: String,
    #[prost(string, tag = "2")]
    pub callsign: String,
}

/// `<__group>`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Group {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub role: String,
}

/// `<precisionlocation>`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrecisionLocation {
    #[prost(string, tag = "1")]
    pub geopointsrc: String,
    #[prost(string, tag = "2")]
    pub altsrc: String,
}

/// `<status>`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(uint32, tag = "1")]
    pub battery: u32,
}

/// `<takv>`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Takv {
    #[prost(string, tag = "1")]
    pub device: String,
    #[prost(string, tag = "2")]
    pub platform: String,
    #[prost(string, tag = "3")]
    pub os: String,
    #[prost(string, tag = "4")]
    pub version: String,
}

/// `<track>`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Track {
    #[prost(double, tag = "1")]
    pub speed: f64,
    #[prost(double, tag = "2")]
    pub course: f64,
}
