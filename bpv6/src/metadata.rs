use super::*;

/// A record of one security encapsulation a block arrived under.
///
/// Pushed onto the block when a PCB/ESB layer is removed, so that later
/// policy evaluation knows the (ciphersuite, security-source,
/// security-destination) that covered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionInfo {
    pub csnum: u64,
    pub security_src: Eid,
    pub security_dest: Eid,
}
