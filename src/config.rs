use std::time::Duration;

use anyhow::bail;

/// Maximum number of status-assisted retries for an in-flight control
///  packet. After this many recovery rounds the request fails with a
///  control timeout. The IPbus suite hard-codes this value rather than
///  making it configurable.
pub const MAX_CONTROL_RETRIES: u32 = 3;

#[derive(Clone, Copy)]
pub struct ClientConfig {
    /// Per-send response timeout, applied both to control packets and to each
    ///  status query during recovery.
    ///
    /// This bounds the latency of the control-timeout signal: a request that
    ///  the target never answers fails after at most
    ///  `(1 + MAX_CONTROL_RETRIES) * response_timeout` plus the status probe
    ///  time spent in each recovery round. Choosing this value close to the
    ///  target's worst-case turnaround avoids both spurious recovery rounds
    ///  (too small) and sluggish failure reporting (too large).
    pub response_timeout: Duration,

    /// Number of status queries sent (including the first) before the status
    ///  prober gives up and reports a status timeout.
    pub status_attempts: u32,
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.response_timeout.is_zero() {
            bail!("response timeout must be non-zero");
        }
        if self.status_attempts == 0 {
            bail!("at least one status attempt is required");
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            response_timeout: Duration::from_millis(1000),
            status_attempts: 2,
        }
    }
}
