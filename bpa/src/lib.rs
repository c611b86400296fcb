/*!
Link, contact and scheduling management for the bundle agent.

The contact manager owns the set of configured links and their state
machines; all mutations are serialised through the daemon event queue. The
contact planner opens scheduled links from a contact plan. Convergence
layers are referenced by name only: the agent wires a link's `cl_name` to a
concrete transport when a contact is established.
*/

pub mod commands;
pub mod contact_manager;
pub mod contact_planner;
pub mod event;
pub mod link;

pub use contact_manager::ContactManager;
pub use contact_planner::ContactPlanner;
pub use event::{ContactReason, LinkEvent};
pub use link::{Contact, Link, LinkParams, LinkState, LinkType};

use perigee_bpv6::Eid;
use tracing::{debug, info, warn};

/// A bundle queued for transmission on a link.
#[derive(Debug, Clone)]
pub struct OutboundBundle {
    pub id: u64,
    pub bytes: bytes::Bytes,
}
