//! Named timeout constants (spec.md §5 "Deadlines"), collected in one place
//! instead of scattered literals — the closest popub gets to the teacher's
//! `ClientConfig` now that there's no config file to hold them (spec.md §6:
//! "No persisted state").

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Handshake and control-phase read/write deadline.
    pub network: Duration,
    /// Local's read deadline while waiting on the ping/CONN loop — longer
    /// than `network` so a single missed ping doesn't trip it.
    pub extended_network: Duration,
    /// Relay's keepalive-ping interval.
    pub ping_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            network: Duration::from_secs(60),
            extended_network: Duration::from_secs(90),
            ping_interval: Duration::from_secs(60),
        }
    }
}
