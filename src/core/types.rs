//! Core value types shared by every manager.

use std::borrow::Borrow;
use std::fmt;

use super::constants::{LEGACY_PROTO, SELF_MAX_PROTO, SELF_MIN_PROTO};

/// Opaque identity of a remote peer.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContactUid(Vec<u8>);

impl ContactUid {
    /// Create a UID from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw UID bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if the UID has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy string rendering.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for ContactUid {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for ContactUid {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&[u8]> for ContactUid {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl Borrow<[u8]> for ContactUid {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContactUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ContactUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContactUid({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Broad category of a CoT message, used to pick broadcast destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoTMessageType {
    /// Position reports and everything that is not chat.
    SituationalAwareness,
    /// GeoChat messages.
    Chat,
}

/// Which transports a send may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoTSendMethod {
    /// Only via a TAK server stream.
    TakServer,
    /// Only via direct mesh (datagram or TCP).
    PointToPoint,
    /// Either.
    #[default]
    Any,
}

impl CoTSendMethod {
    /// True if streaming endpoints may be used.
    pub fn allows_streaming(self) -> bool {
        matches!(self, CoTSendMethod::TakServer | CoTSendMethod::Any)
    }

    /// True if datagram or TCP endpoints may be used.
    pub fn allows_mesh(self) -> bool {
        matches!(self, CoTSendMethod::PointToPoint | CoTSendMethod::Any)
    }
}

/// Endpoint type advertised inside a CoT contact element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointType {
    /// No endpoint advertised.
    #[default]
    None,
    /// Direct UDP.
    Udp,
    /// Direct TCP.
    Tcp,
    /// Via a TAK server.
    Streaming,
    /// TCP to the packet's source address.
    TcpUseSrc,
    /// UDP to the packet's source address.
    UdpUseSrc,
}

/// The kind of endpoint record stored for a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContactEndpointType {
    /// UDP mesh endpoint.
    Datagram,
    /// Direct TCP endpoint.
    Tcp,
    /// TAK server stream.
    Streaming,
}

/// Error codes reported to interface status listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetInterfaceErrorCode {
    /// Hostname could not be resolved.
    ConnNameResFailed,
    /// Remote refused the connection.
    ConnRefused,
    /// Connect timed out.
    ConnTimeout,
    /// Remote host unreachable.
    ConnHostUnreachable,
    /// Server presented no certificate.
    ConnSslNoPeerCert,
    /// Server certificate is not trusted by the configured CA.
    ConnSslPeerCertNotTrusted,
    /// TLS handshake failed.
    ConnSslHandshake,
    /// Other connection error.
    ConnOther,
    /// No data received within the monitor timeout.
    IoRxDataTimeout,
    /// Socket read or write error.
    Io,
    /// Internal error.
    Internal,
    /// Anything else.
    Other,
}

/// Range of TAK protocol versions a peer supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TakProtoInfo {
    /// Lowest supported version.
    pub min: u32,
    /// Highest supported version.
    pub max: u32,
}

impl TakProtoInfo {
    /// Create a version range.
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// The range this implementation supports.
    pub const fn local() -> Self {
        Self::new(SELF_MIN_PROTO, SELF_MAX_PROTO)
    }

    /// True if the ranges share at least one version.
    pub fn overlaps(&self, other: &TakProtoInfo) -> bool {
        self.intersect(other).is_some()
    }

    /// Intersection of two ranges, `None` if disjoint.
    pub fn intersect(&self, other: &TakProtoInfo) -> Option<TakProtoInfo> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(TakProtoInfo { min, max })
    }

    /// Highest version usable with a peer advertising this range.
    pub fn send_version(&self) -> u32 {
        match self.intersect(&Self::local()) {
            Some(common) => common.max,
            None => LEGACY_PROTO,
        }
    }
}

/// Position report used when building file-transfer CoT.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoTPointData {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Height above ellipsoid in meters.
    pub hae: f64,
    /// Circular error in meters.
    pub ce: f64,
    /// Linear error in meters.
    pub le: f64,
}

impl CoTPointData {
    /// Sentinel for an unknown value.
    pub const NO_VALUE: f64 = 9_999_999.0;

    /// Create a point.
    pub const fn new(lat: f64, lon: f64, hae: f64, ce: f64, le: f64) -> Self {
        Self { lat, lon, hae, ce, le }
    }
}

impl Default for CoTPointData {
    fn default() -> Self {
        Self::new(0.0, 0.0, Self::NO_VALUE, Self::NO_VALUE, Self::NO_VALUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_intersection() {
        let a = TakProtoInfo::new(1, 2);
        let b = TakProtoInfo::new(2, 3);
        assert_eq!(a.intersect(&b), Some(TakProtoInfo::new(2, 2)));
        assert!(!TakProtoInfo::new(1, 1).overlaps(&TakProtoInfo::new(2, 2)));
    }

    #[test]
    fn test_send_version() {
        assert_eq!(TakProtoInfo::new(1, 3).send_version(), 1);
        assert_eq!(TakProtoInfo::new(0, 0).send_version(), 0);
        assert_eq!(TakProtoInfo::new(2, 4).send_version(), 0);
    }

    #[test]
    fn test_send_method_masks() {
        assert!(CoTSendMethod::Any.allows_mesh());
        assert!(CoTSendMethod::Any.allows_streaming());
        assert!(!CoTSendMethod::TakServer.allows_mesh());
        assert!(!CoTSendMethod::PointToPoint.allows_streaming());
    }

    #[test]
    fn test_contact_uid_display() {
        let uid = ContactUid::from("ANDROID-1234");
        assert_eq!(uid.to_string(), "ANDROID-1234");
        assert_eq!(uid.as_bytes(), b"ANDROID-1234");
        assert!(ContactUid::default().is_empty());
    }
}
