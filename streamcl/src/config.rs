use super::*;
use perigee_bpv6::Eid;
use std::sync::Arc;

/// A callback asked whether payload storage can absorb another bundle of
/// the given size. Returning `false` pauses delivery; the connection
/// retries every five seconds while keepalives keep the contact alive.
pub type QuotaCheck = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// Per-connection configuration.
#[derive(Clone)]
pub struct Config {
    pub local_eid: Eid,

    /// The protocol version offered in the contact header.
    pub version: u8,

    /// Maximum payload octets per data segment.
    pub segment_length: usize,

    /// Seconds between keepalives when the line is quiet; zero disables
    /// both keepalives and the data timeout.
    pub keepalive_interval: u16,

    /// Milliseconds without any traffic from the peer before the contact
    /// is considered broken.
    pub data_timeout: u32,

    /// Seconds of bidirectional silence after which an ONDEMAND link shuts
    /// down cleanly; zero disables idle closing.
    pub idle_close_time: u32,

    /// Concurrent in-flight bundle cap when draining the link queue.
    pub max_inflight_bundles: usize,

    pub segment_ack_enabled: bool,
    pub reactive_frag_enabled: bool,

    /// Reset liveness instead of breaking the contact on a data timeout.
    pub tolerate_keepalive_faults: bool,

    /// The remote EID this link was configured with, if known; a mismatch
    /// with the peer's contact header is logged but not fatal.
    pub expected_remote_eid: Option<Eid>,

    /// Payload storage admission check.
    pub quota: Option<QuotaCheck>,
}

impl Config {
    pub fn new(local_eid: Eid) -> Self {
        Self {
            local_eid,
            version: 3,
            segment_length: 4096,
            keepalive_interval: 10,
            data_timeout: 30_000,
            idle_close_time: 0,
            max_inflight_bundles: 100,
            segment_ack_enabled: true,
            reactive_frag_enabled: false,
            tolerate_keepalive_faults: false,
            expected_remote_eid: None,
            quota: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("local_eid", &self.local_eid)
            .field("version", &self.version)
            .field("segment_length", &self.segment_length)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("data_timeout", &self.data_timeout)
            .field("idle_close_time", &self.idle_close_time)
            .field("max_inflight_bundles", &self.max_inflight_bundles)
            .finish()
    }
}
