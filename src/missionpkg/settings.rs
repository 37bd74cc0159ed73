//! Transfer tunables.

use std::time::Duration;

use crate::core::constants::{
    DEFAULT_MP_CONN_TIMEOUT_SECS, DEFAULT_MP_HTTP_PORT, DEFAULT_MP_HTTPS_PORT, DEFAULT_MP_NUM_TRIES,
    DEFAULT_MP_XFER_TIMEOUT_SECS, MIN_MP_CONN_TIMEOUT_SECS, MIN_MP_XFER_TIMEOUT_SECS,
};
use crate::core::{CommoError, Result};
use crate::http::{HttpOptions, HttpTls};

/// Settings captured by each transfer when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MPTransferSettings {
    http_port: u16,
    https_port: u16,
    num_tries: u32,
    conn_timeout_secs: u64,
    xfer_timeout_secs: u64,
    server_transfer_enabled: bool,
}

impl Default for MPTransferSettings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_MP_HTTP_PORT,
            https_port: DEFAULT_MP_HTTPS_PORT,
            num_tries: DEFAULT_MP_NUM_TRIES,
            conn_timeout_secs: DEFAULT_MP_CONN_TIMEOUT_SECS,
            xfer_timeout_secs: DEFAULT_MP_XFER_TIMEOUT_SECS,
            server_transfer_enabled: true,
        }
    }
}

impl MPTransferSettings {
    /// TAK server http port for uploads.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// TAK server https port for uploads.
    pub fn https_port(&self) -> u16 {
        self.https_port
    }

    /// Download attempts before giving up.
    pub fn num_tries(&self) -> u32 {
        self.num_tries
    }

    /// Connect timeout in seconds.
    pub fn conn_timeout_secs(&self) -> u64 {
        self.conn_timeout_secs
    }

    /// Transfer timeout in seconds.
    pub fn xfer_timeout_secs(&self) -> u64 {
        self.xfer_timeout_secs
    }

    /// Whether sends may go through a TAK server.
    pub fn server_transfer_enabled(&self) -> bool {
        self.server_transfer_enabled
    }

    /// Set the server http port. Port 0 is rejected.
    pub fn set_http_port(&mut self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(CommoError::invalid("http port out of range"));
        }
        self.http_port = port;
        Ok(())
    }

    /// Set the server https port. Port 0 is rejected.
    pub fn set_https_port(&mut self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(CommoError::invalid("https port out of range"));
        }
        self.https_port = port;
        Ok(())
    }

    /// At least 1.
    pub fn set_num_tries(&mut self, tries: u32) -> Result<()> {
        if tries < 1 {
            return Err(CommoError::invalid("at least one try is required"));
        }
        self.num_tries = tries;
        Ok(())
    }

    /// At least 5 seconds.
    pub fn set_conn_timeout_secs(&mut self, secs: u64) -> Result<()> {
        if secs < MIN_MP_CONN_TIMEOUT_SECS {
            return Err(CommoError::invalid(format!(
                "connect timeout below {MIN_MP_CONN_TIMEOUT_SECS}s"
            )));
        }
        self.conn_timeout_secs = secs;
        Ok(())
    }

    /// At least 15 seconds.
    pub fn set_xfer_timeout_secs(&mut self, secs: u64) -> Result<()> {
        if secs < MIN_MP_XFER_TIMEOUT_SECS {
            return Err(CommoError::invalid(format!(
                "transfer timeout below {MIN_MP_XFER_TIMEOUT_SECS}s"
            )));
        }
        self.xfer_timeout_secs = secs;
        Ok(())
    }

    /// Allow or forbid sends through a TAK server.
    pub fn set_server_transfer_enabled(&mut self, enabled: bool) {
        self.server_transfer_enabled = enabled;
    }

    pub(crate) fn http_options(&self, tls: HttpTls) -> HttpOptions {
        HttpOptions {
            tls,
            connect_timeout: Duration::from_secs(self.conn_timeout_secs),
            transfer_timeout: Duration::from_secs(self.xfer_timeout_secs),
            basic_auth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = MPTransferSettings::default();
        assert_eq!((s.http_port(), s.https_port()), (8080, 8443));
        assert_eq!(s.num_tries(), 10);
        assert_eq!((s.conn_timeout_secs(), s.xfer_timeout_secs()), (90, 120));
        assert!(s.server_transfer_enabled());
    }

    #[test]
    fn test_setters_validate() {
        let mut s = MPTransferSettings::default();
        assert!(s.set_http_port(0).is_err());
        assert!(s.set_num_tries(0).is_err());
        assert!(s.set_conn_timeout_secs(4).is_err());
        assert!(s.set_xfer_timeout_secs(14).is_err());
        assert_eq!(s, MPTransferSettings::default());

        s.set_num_tries(1).unwrap();
        s.set_conn_timeout_secs(5).unwrap();
        s.set_xfer_timeout_secs(15).unwrap();
        s.set_https_port(443).unwrap();
        assert_eq!((s.num_tries(), s.conn_timeout_secs(), s.xfer_timeout_secs()), (1, 5, 15));
        assert_eq!(s.https_port(), 443);
    }
}
