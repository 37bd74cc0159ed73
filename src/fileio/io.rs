//! Client callbacks for simple file transfers.

/// Outcome or progress of a simple file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimpleFileIOStatus {
    /// Bytes are moving.
    InProgress,
    /// The transfer completed.
    Success,
    /// The server name did not resolve.
    HostResolutionFail,
    /// No connection could be made.
    ConnectFail,
    /// The URL is malformed.
    UrlInvalid,
    /// The URL scheme is not supported.
    UrlUnsupported,
    /// The server has nothing at that URL.
    UrlNoResource,
    /// The local file could not be opened.
    LocalFileOpenFailure,
    /// Reading or writing the local file failed.
    LocalIoError,
    /// The server certificate is not trusted.
    SslUntrustedServer,
    /// Any other TLS failure.
    SslOtherError,
    /// The server rejected the credentials.
    AuthError,
    /// The server refused access.
    AccessDenied,
    /// The transfer stalled.
    TransferTimeout,
    /// Anything else.
    OtherError,
}

/// One status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleFileIOUpdate {
    /// Id returned by the init call.
    pub xfer_id: u32,
    /// Current state.
    pub status: SimpleFileIOStatus,
    /// Failure detail.
    pub additional_info: Option<String>,
    /// Bytes moved so far.
    pub bytes_transferred: u64,
    /// Expected total, 0 when unknown.
    pub total_bytes_to_transfer: u64,
}

/// Receives transfer reports, in order, on a dedicated thread.
pub trait SimpleFileIO: Send + Sync {
    /// A transfer made progress or finished.
    fn file_transfer_update(&self, update: &SimpleFileIOUpdate);
}
