//! Client callbacks and status reports for mission package transfers.

use std::path::PathBuf;

use crate::core::{CoTPointData, ContactUid};

/// State of a transfer as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissionPackageTransferStatus {
    /// The transfer completed.
    FinishedSuccess,
    /// No acknowledgement arrived in time.
    FinishedTimedOut,
    /// The recipient cannot be reached.
    FinishedContactGone,
    /// The transfer failed for good.
    FinishedFailed,
    /// The receiver already has the file.
    FinishedFileExists,
    /// Transfers are disabled on this side.
    FinishedDisabledLocally,
    /// An attempt is running.
    AttemptInProgress,
    /// An attempt failed; another follows.
    AttemptFailed,
    /// Waiting to upload to the TAK server.
    ServerUploadPending,
    /// Upload to the TAK server running.
    ServerUploadInProgress,
    /// The package is on the TAK server.
    ServerUploadSuccess,
    /// The package could not be put on the TAK server.
    ServerUploadFailed,
}

impl MissionPackageTransferStatus {
    /// True for statuses that end a transfer.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::FinishedSuccess
                | Self::FinishedTimedOut
                | Self::FinishedContactGone
                | Self::FinishedFailed
                | Self::FinishedFileExists
                | Self::FinishedDisabledLocally
        )
    }
}

/// Progress of an outgoing transfer to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendStatusUpdate {
    /// Id returned by the send init call.
    pub xfer_id: u32,
    /// Recipient; `None` for uploads to the server alone.
    pub recipient: Option<ContactUid>,
    /// Current state.
    pub status: MissionPackageTransferStatus,
    /// Reason or server URL, depending on the status.
    pub detail: Option<String>,
    /// Bytes moved so far.
    pub total_bytes_transferred: u64,
}

/// Progress of an incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveStatusUpdate {
    /// Destination chosen by the client.
    pub local_file: PathBuf,
    /// Current state.
    pub status: MissionPackageTransferStatus,
    /// Bytes written so far in this attempt.
    pub total_bytes_received: u64,
    /// Size announced by the sender.
    pub total_bytes_expected: u64,
    /// Current attempt, starting at 1.
    pub attempt: u32,
    /// Attempts allowed.
    pub max_attempts: u32,
    /// Failure reason.
    pub error_detail: Option<String>,
}

/// Application side of mission package transfers.
pub trait MissionPackageIO: Send + Sync {
    /// A peer offers a package. Return where to store it, or the status
    /// explaining why it is not wanted: `FinishedFileExists` and
    /// `FinishedDisabledLocally` are acknowledged to the sender, anything
    /// else is dropped silently.
    fn mission_package_receive_init(
        &self,
        dest_file: &str,
        transfer_name: &str,
        sha256: &str,
        size: u64,
        sender_callsign: &str,
    ) -> Result<PathBuf, MissionPackageTransferStatus>;

    /// Progress of an outgoing transfer.
    fn mission_package_send_status_update(&self, update: &SendStatusUpdate);

    /// Progress of an incoming transfer.
    fn mission_package_receive_status_update(&self, update: &ReceiveStatusUpdate);

    /// Position placed in transfer requests and acknowledgements.
    fn current_point(&self) -> CoTPointData;
}
