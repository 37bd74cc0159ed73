//! Messaging constants.
//!
//! Timeouts, ports and wire values shared by the transport managers.

use std::time::Duration;

// =============================================================================
// PROTOCOL VERSIONS
// =============================================================================

/// Lowest TAK protocol version this implementation speaks.
pub const SELF_MIN_PROTO: u32 = 1;

/// Highest TAK protocol version this implementation speaks.
pub const SELF_MAX_PROTO: u32 = 1;

/// Legacy XML-only protocol version.
pub const LEGACY_PROTO: u32 = 0;

/// Protocol information older than this is treated as legacy.
pub const PROTOINF_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between unsolicited protocol-support broadcasts.
pub const PROTOINF_BCAST: Duration = Duration::from_secs(40);

// =============================================================================
// WIRE FRAMING
// =============================================================================

/// Magic byte that starts every TAK protocol header.
pub const TAKPROTO_MAGIC: u8 = 0xBF;

/// Largest protobuf payload accepted from a stream.
pub const STREAM_MAX_PROTO_LEN: usize = 1024 * 1024;

/// Initial receive buffer size for a streaming connection.
pub const STREAM_RX_BUFFER_SIZE: usize = 200 * 1024;

/// End-of-message token for XML streams.
pub const XML_END_TOKEN: &[u8] = b"</event>";

/// Largest UDP datagram accepted.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

// =============================================================================
// CONTACTS
// =============================================================================

/// Mesh endpoints idle for longer than this yield to a streaming endpoint.
pub const CONTACT_DIRECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default UDP port advertised in contact endpoints.
pub const DEFAULT_UDP_PORT: u16 = 6969;

/// Default TCP port advertised in contact endpoints.
pub const DEFAULT_TCP_PORT: u16 = 4242;

/// UDP port that discovered contacts receive chat on.
pub const DEFAULT_CHAT_PORT: u16 = 17012;

// =============================================================================
// DATAGRAM
// =============================================================================

/// Receive sockets without traffic for this many seconds are rebuilt.
pub const DEFAULT_RX_NO_DATA_REBUILD_SECS: u64 = 30;

/// Default multicast TTL.
pub const DEFAULT_MCAST_TTL: u32 = 1;

/// Idle tick of the datagram receive loop.
pub const DATAGRAM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Sleep between non-blocking datagram socket polls while idle.
pub const DATAGRAM_IDLE_SLEEP: Duration = Duration::from_millis(20);

// =============================================================================
// TCP
// =============================================================================

/// Largest message accepted from one inbound TCP client.
pub const RX_CLIENT_MAX_DATA_LEN: usize = 500 * 1024;

/// Failed inbound listeners are recreated after this long.
pub const INBOUND_RETRY: Duration = Duration::from_secs(60);

/// Default connect timeout for direct TCP sends.
pub const DEFAULT_TCP_CONN_TIMEOUT: Duration = Duration::from_secs(20);

/// Smallest accepted TCP connect timeout.
pub const MIN_TCP_CONN_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle sleep of the TCP I/O loop.
pub const TCP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Hostname resolution attempts for direct TCP sends.
pub const TCP_RESOLVE_TRIES: u32 = 1;

/// Resolution retry interval for direct TCP sends.
pub const TCP_RESOLVE_RETRY: Duration = Duration::from_secs(5);

// =============================================================================
// STREAMING
// =============================================================================

/// Time allowed for protocol negotiation steps.
pub const PROTO_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout for streaming connections.
pub const DEFAULT_STREAM_CONN_TIMEOUT: Duration = Duration::from_secs(20);

/// Backoff before reconnecting a failed streaming connection.
pub const CONN_RETRY: Duration = Duration::from_secs(15);

/// Retry interval for unresolvable streaming hosts.
pub const RESOLVE_RETRY: Duration = Duration::from_secs(30);

/// Quiet period after which a ping is sent.
pub const RX_STALE: Duration = Duration::from_secs(15);

/// Minimum spacing of pings on a stale connection.
pub const RX_STALE_PING: Duration = Duration::from_millis(4500);

/// Quiet period after which the connection is torn down.
pub const RX_TIMEOUT: Duration = Duration::from_secs(25);

/// Idle tick of the streaming I/O loop.
pub const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Endpoint host used on messages received from a streaming server.
pub const STREAMING_ENDPOINT_HOST: &str = "*";

// =============================================================================
// MISSION PACKAGES
// =============================================================================

/// Default peer-hosted http port.
pub const DEFAULT_MP_HTTP_PORT: u16 = 8080;

/// Default peer-hosted https port.
pub const DEFAULT_MP_HTTPS_PORT: u16 = 8443;

/// Default download attempts.
pub const DEFAULT_MP_NUM_TRIES: u32 = 10;

/// Default connect timeout for transfers, in seconds.
pub const DEFAULT_MP_CONN_TIMEOUT_SECS: u64 = 90;

/// Smallest connect timeout for transfers, in seconds.
pub const MIN_MP_CONN_TIMEOUT_SECS: u64 = 5;

/// Default transfer timeout, in seconds.
pub const DEFAULT_MP_XFER_TIMEOUT_SECS: u64 = 120;

/// Smallest transfer timeout, in seconds.
pub const MIN_MP_XFER_TIMEOUT_SECS: u64 = 15;

/// Delay between download attempts against the same URL.
pub const MP_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Stale time of file transfer request and ack CoT.
pub const FILE_XFER_STALE: Duration = Duration::from_secs(10);

/// Outstanding acknowledgements older than this are reported as timed out.
pub const MP_ACK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Idle sleep of the HTTPS front end.
pub const HTTPS_PROXY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default idle limit of a proxied HTTPS connection.
pub const DEFAULT_HTTPS_PROXY_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// Banner returned by the embedded web server's info endpoint.
pub const FILE_SERVER_INFO: &str = "Commo file server";

// =============================================================================
// THREAD NAMES
// =============================================================================

/// Contact manager threads.
pub const CONTACT_THREADS: &[&str] = &["cmoctc.evnt", "cmoctc.proto"];

/// Datagram manager threads.
pub const DATAGRAM_THREADS: &[&str] = &["cmodg.tx", "cmodg.rx", "cmodg.rxq"];

/// TCP manager threads.
pub const TCP_THREADS: &[&str] = &["cmotcp.io", "cmotcp.rxq", "cmotcp.txerr"];

/// Streaming manager threads.
pub const STREAMING_THREADS: &[&str] = &["cmostrm.conn", "cmostrm.io", "cmostrm.rxq"];

/// Mission package manager threads.
pub const MP_THREADS: &[&str] = &["cmompmgr.evnt", "cmompmgr.rx", "cmompmgr.txack", "cmompmgr.txup"];

/// HTTPS front end thread.
pub const HTTPS_PROXY_THREADS: &[&str] = &["cmohttps.io"];

/// Simple file transfer threads.
pub const SIMPLE_FILE_THREADS: &[&str] = &["cmosfio.io", "cmosfio.stat"];

/// Hostname resolver thread.
pub const RESOLVER_THREAD: &str = "cmoresolver";

/// Hardware interface scanner thread.
pub const IFSCAN_THREAD: &str = "cmoifscan";

/// CoT listener delivery thread.
pub const COT_LISTENER_THREAD: &str = "cmo.cotlistn";
