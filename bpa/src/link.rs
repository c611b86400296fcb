use super::*;
use std::collections::VecDeque;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link '{0}' already exists")]
    Exists(String),

    #[error("Link '{0}' does not exist")]
    Unknown(String),

    #[error("Link '{0}' conflicts with a previously configured link")]
    InconsistentWithPrevious(String),

    #[error("Unknown link type '{0}'")]
    BadType(String),

    #[error("Unknown link option '{0}'")]
    BadOption(String),

    #[error("Bad value for link option '{0}'")]
    BadValue(String),

    #[error("The contact manager is shutting down")]
    ShuttingDown,
}

/// How a link's availability is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Expected to be open whenever the daemon runs; reopened on failure.
    AlwaysOn,
    /// Opened when traffic is queued; closed when idle.
    OnDemand,
    /// Opened and closed by the contact planner.
    Scheduled,
    /// Discovered at runtime; availability is externally signalled.
    Opportunistic,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::AlwaysOn => "ALWAYSON",
            LinkType::OnDemand => "ONDEMAND",
            LinkType::Scheduled => "SCHEDULED",
            LinkType::Opportunistic => "OPPORTUNISTIC",
        }
    }
}

impl FromStr for LinkType {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALWAYSON" => Ok(LinkType::AlwaysOn),
            "ONDEMAND" => Ok(LinkType::OnDemand),
            "SCHEDULED" => Ok(LinkType::Scheduled),
            "OPPORTUNISTIC" => Ok(LinkType::Opportunistic),
            _ => Err(LinkError::BadType(s.to_string())),
        }
    }
}

/// The link state machine:
/// UNAVAILABLE ⇄ AVAILABLE → OPENING → OPEN → (CLOSED | UNAVAILABLE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Unavailable,
    Available,
    Opening,
    Open,
    Closed,
}

/// Configurable per-link parameters; mutated only between contacts or via
/// `reconfigure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParams {
    pub mtu: u64,
    /// Seconds; the first retry delay after a broken contact.
    pub min_retry_interval: u32,
    /// Seconds; retry delays double up to this cap.
    pub max_retry_interval: u32,
    /// Seconds an ONDEMAND link may sit idle before a clean shutdown.
    pub idle_close_time: u32,
    /// Seconds of downtime to assume when none is known.
    pub potential_downtime: u32,
    /// Attach a previous-hop block to forwarded bundles.
    pub prevhop_hdr: bool,
    pub cost: u32,
    pub qlimit_bundles_high: u64,
    pub qlimit_bytes_high: u64,
    pub qlimit_bundles_low: u64,
    pub qlimit_bytes_low: u64,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            mtu: 0,
            min_retry_interval: 5,
            max_retry_interval: 10 * 60,
            idle_close_time: 0,
            potential_downtime: 30,
            prevhop_hdr: false,
            cost: 100,
            qlimit_bundles_high: 0,
            qlimit_bytes_high: 0,
            qlimit_bundles_low: 0,
            qlimit_bytes_low: 0,
        }
    }
}

impl LinkParams {
    /// Applies one `option=value` setting.
    pub fn set(&mut self, option: &str, value: &str) -> Result<(), LinkError> {
        let bad = || LinkError::BadValue(option.to_string());
        match option {
            "mtu" => self.mtu = value.parse().map_err(|_| bad())?,
            "min_retry_interval" => self.min_retry_interval = value.parse().map_err(|_| bad())?,
            "max_retry_interval" => self.max_retry_interval = value.parse().map_err(|_| bad())?,
            // alias kept for older configuration files
            "retry_interval" => {
                self.min_retry_interval = value.parse().map_err(|_| bad())?;
            }
            "idle_close_time" => self.idle_close_time = value.parse().map_err(|_| bad())?,
            "potential_downtime" => self.potential_downtime = value.parse().map_err(|_| bad())?,
            "prevhop_hdr" => self.prevhop_hdr = value.parse().map_err(|_| bad())?,
            "cost" => self.cost = value.parse().map_err(|_| bad())?,
            "qlimit_bundles_high" => {
                self.qlimit_bundles_high = value.parse().map_err(|_| bad())?;
            }
            "qlimit_bytes_high" => self.qlimit_bytes_high = value.parse().map_err(|_| bad())?,
            "qlimit_bundles_low" => self.qlimit_bundles_low = value.parse().map_err(|_| bad())?,
            "qlimit_bytes_low" => self.qlimit_bytes_low = value.parse().map_err(|_| bad())?,
            _ => return Err(LinkError::BadOption(option.to_string())),
        }
        Ok(())
    }
}

/// Counters reported by `link stats`.
#[derive(Debug, Default, Clone)]
pub struct LinkStats {
    pub contact_attempts: u64,
    pub contacts: u64,
    pub bundles_transmitted: u64,
    pub bytes_transmitted: u64,
    pub bundles_cancelled: u64,
}

/// A live session over a link; exists only while the link is OPEN.
#[derive(Debug, Clone)]
pub struct Contact {
    pub start: time::OffsetDateTime,
    pub duration: std::time::Duration,
}

/// A named, typed peering over one convergence layer.
#[derive(Debug)]
pub struct Link {
    name: String,
    link_type: LinkType,
    cl_name: String,
    nexthop: String,

    pub state: LinkState,
    pub params: LinkParams,
    pub remote_eid: Eid,

    /// Current retry delay in seconds; zero until the first failure.
    pub retry_interval: u32,

    /// This link reuses the identity of one reloaded from the datastore.
    pub reincarnated: bool,
    /// The forwarding log refers to this link, so its name must stay
    /// reserved after deletion.
    pub used_in_fwdlog: bool,
    pub deleted: bool,

    pub queue: VecDeque<OutboundBundle>,
    pub inflight: Vec<u64>,
    pub stats: LinkStats,
    pub contact: Option<Contact>,
}

impl Link {
    pub fn new(name: &str, nexthop: &str, link_type: LinkType, cl_name: &str) -> Self {
        Self {
            name: name.to_string(),
            link_type,
            cl_name: cl_name.to_string(),
            nexthop: nexthop.to_string(),
            state: LinkState::Unavailable,
            params: LinkParams::default(),
            remote_eid: Eid::Null,
            retry_interval: 0,
            reincarnated: false,
            used_in_fwdlog: false,
            deleted: false,
            queue: VecDeque::new(),
            inflight: Vec::new(),
            stats: LinkStats::default(),
            contact: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn cl_name(&self) -> &str {
        &self.cl_name
    }

    pub fn nexthop(&self) -> &str {
        &self.nexthop
    }

    /// One line of `link dump` output.
    pub fn dump(&self) -> String {
        format!(
            "{}: {} {} {} state={:?} remote={} queued={} inflight={}",
            self.name,
            self.nexthop,
            self.link_type.as_str(),
            self.cl_name,
            self.state,
            self.remote_eid,
            self.queue.len(),
            self.inflight.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_from_options() {
        let mut params = LinkParams::default();
        params.set("mtu", "1400").unwrap();
        params.set("min_retry_interval", "1").unwrap();
        params.set("max_retry_interval", "8").unwrap();
        params.set("idle_close_time", "30").unwrap();
        params.set("prevhop_hdr", "true").unwrap();
        assert_eq!(params.mtu, 1400);
        assert_eq!(params.min_retry_interval, 1);
        assert_eq!(params.max_retry_interval, 8);
        assert_eq!(params.idle_close_time, 30);
        assert!(params.prevhop_hdr);

        assert!(matches!(
            params.set("no_such_option", "1"),
            Err(LinkError::BadOption(_))
        ));
        assert!(matches!(
            params.set("mtu", "not-a-number"),
            Err(LinkError::BadValue(_))
        ));
    }

    #[test]
    fn link_type_parsing() {
        assert_eq!("alwayson".parse::<LinkType>().unwrap(), LinkType::AlwaysOn);
        assert_eq!(
            "OPPORTUNISTIC".parse::<LinkType>().unwrap(),
            LinkType::Opportunistic
        );
        assert!("sometimes".parse::<LinkType>().is_err());
    }
}
