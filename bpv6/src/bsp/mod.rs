/*!
The Bundle Security Protocol engine.

Four block families are implemented, each as a strategy selected by
ciphersuite number: Bundle Authentication (BAB 1/5/9), Payload Integrity
(PIB 2/6/10), Payload Confidentiality (PCB 3/7/11) and Extension Security
(ESB 4/8/12). The bundle-protocol driver calls the lifecycle hooks in fixed
order: `prepare` and `generate` walk the transmit block vector head to
tail, `finalize` walks it tail to head so that later-block data can
contribute to earlier-block results, and `validate` walks the receive
vector head to tail.
*/

use super::*;
use thiserror::Error;

pub mod keystore;
pub mod policy;

mod bab;
mod canonical;
mod encap;
mod esb;
mod kem;
mod locals;
mod pcb;
mod pib;


pub use bab::Bab;
pub use esb::Esb;
pub use locals::{BspLocals, cs_flags, tags};
pub use pcb::Pcb;
pub use pib::Pib;

/// An error raised by the security engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation failed: the bundle must be deleted with reason
    /// SECURITY_FAILED.
    #[error("Security validation failed: {0}")]
    Failed(&'static str),

    /// No usable key for the peer and ciphersuite.
    #[error("No key for host '{host}' ciphersuite {csnum}")]
    KeyNotFound { host: String, csnum: u64 },

    /// A key exists but has the wrong shape for the operation.
    #[error("Unusable key for host '{host}': {reason}")]
    BadKey { host: String, reason: &'static str },

    /// The ciphersuite number is not registered.
    #[error("Unknown ciphersuite {0}")]
    UnknownCiphersuite(u64),

    /// A security block's content could not be parsed.
    #[error("Malformed security block: {0}")]
    Malformed(&'static str),

    /// The outgoing policy demands a layering the bundle cannot satisfy.
    #[error("Inconsistent security policy: {0}")]
    Inconsistent(&'static str),

    /// A failure in the underlying cryptographic backend.
    #[error("Crypto backend failure: {0}")]
    Backend(String),
}

/// The four security block families.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CsKind {
    Bab,
    Pib,
    Pcb,
    Esb,
}

impl CsKind {
    /// The family a ciphersuite number belongs to.
    pub fn of(csnum: u64) -> Option<CsKind> {
        match csnum {
            1 | 5 | 9 => Some(CsKind::Bab),
            2 | 6 | 10 => Some(CsKind::Pib),
            3 | 7 | 11 => Some(CsKind::Pcb),
            4 | 8 | 12 => Some(CsKind::Esb),
            _ => None,
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            CsKind::Bab => BlockType::BundleAuthentication,
            CsKind::Pib => BlockType::PayloadIntegrity,
            CsKind::Pcb => BlockType::Confidentiality,
            CsKind::Esb => BlockType::ExtensionSecurity,
        }
    }
}

/// A registered ciphersuite strategy.
#[derive(Debug, Copy, Clone)]
pub enum Ciphersuite {
    Bab(Bab),
    Pib(Pib),
    Pcb(Pcb),
    Esb(Esb),
}

impl Ciphersuite {
    pub fn csnum(&self) -> u64 {
        match self {
            Ciphersuite::Bab(cs) => cs.csnum(),
            Ciphersuite::Pib(cs) => cs.csnum(),
            Ciphersuite::Pcb(cs) => cs.csnum(),
            Ciphersuite::Esb(cs) => cs.csnum(),
        }
    }

    pub fn kind(&self) -> CsKind {
        match self {
            Ciphersuite::Bab(_) => CsKind::Bab,
            Ciphersuite::Pib(_) => CsKind::Pib,
            Ciphersuite::Pcb(_) => CsKind::Pcb,
            Ciphersuite::Esb(_) => CsKind::Esb,
        }
    }

    /// Called on a security block after the bundle is reloaded from the
    /// datastore: in-memory security state is dropped so the block is
    /// treated as unprocessed and revalidates on next use.
    pub fn reload_post_process(&self, block: &mut BlockInfo) {
        block.locals = None;
    }
}

/// The sealed set of ciphersuites known to this agent, looked up by number.
#[derive(Debug)]
pub struct Registry {
    suites: Vec<Ciphersuite>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

impl Registry {
    /// Registers ciphersuites 1 through 12.
    pub fn standard() -> Self {
        Self {
            suites: vec![
                Ciphersuite::Bab(Bab::new(1)),
                Ciphersuite::Pib(Pib::new(2)),
                Ciphersuite::Pcb(Pcb::new(3)),
                Ciphersuite::Esb(Esb::new(4)),
                Ciphersuite::Bab(Bab::new(5)),
                Ciphersuite::Pib(Pib::new(6)),
                Ciphersuite::Pcb(Pcb::new(7)),
                Ciphersuite::Esb(Esb::new(8)),
                Ciphersuite::Bab(Bab::new(9)),
                Ciphersuite::Pib(Pib::new(10)),
                Ciphersuite::Pcb(Pcb::new(11)),
                Ciphersuite::Esb(Esb::new(12)),
            ],
        }
    }

    pub fn find(&self, csnum: u64) -> Result<&Ciphersuite, Error> {
        self.suites
            .iter()
            .find(|cs| cs.csnum() == csnum)
            .ok_or(Error::UnknownCiphersuite(csnum))
    }
}

/// Everything the lifecycle hooks need beyond the bundle itself.
pub struct SecurityContext<'a> {
    pub registry: &'a Registry,
    pub keystore: &'a keystore::KeyStore,
    /// This node's administrative EID.
    pub local_eid: &'a Eid,
}

/// A correlator unique within the bundle: the low bits count the security
/// blocks already present; callers OR in their ciphersuite number high.
pub(crate) fn create_correlator(xmit: &BlockList) -> u64 {
    xmit.blocks.iter().filter(|b| b.locals.is_some()).count() as u64
}

/// The outcome of one validated security operation on receive.
#[derive(Debug)]
pub struct ValidatedOp {
    pub kind: CsKind,
    pub csnum: u64,
    pub security_src: Eid,
    pub security_dest: Eid,
    /// Indices of the blocks this operation restored (PCB/ESB families).
    pub restored: Vec<usize>,
}

/// The result of walking a received block vector through validation.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub ops: Vec<ValidatedOp>,
}

impl ValidationReport {
    pub fn satisfied(
        &self,
        kind: CsKind,
        csnums: &[u64],
        src: &EidPattern,
        dest: &EidPattern,
    ) -> bool {
        self.ops.iter().any(|op| {
            op.kind == kind
                && csnums.contains(&op.csnum)
                && src.matches(&op.security_src)
                && dest.matches(&op.security_dest)
        })
    }
}

/// Runs the transmit-side generate pass, fixes the terminal-block flag,
/// emits the primary block, and runs the finalize pass in reverse order.
///
/// On entry `xmit` holds the payload and any extension blocks, with
/// security blocks inserted (but not yet serialised) by
/// [`policy::prepare_out_blocks`]. On exit every block, the primary
/// included, is complete and wire-ready.
pub fn finish_bundle(
    ctx: &SecurityContext,
    bundle: &Bundle,
    xmit: &mut BlockList,
) -> Result<(), Error> {
    // generate, in block order
    for idx in 0..xmit.blocks.len() {
        let Some(csnum) = xmit.blocks[idx].locals.as_ref().map(|l| l.csnum) else {
            continue;
        };
        if !xmit.blocks[idx].complete() {
            match ctx.registry.find(csnum)? {
                Ciphersuite::Bab(cs) => cs.generate(ctx, bundle, xmit, idx)?,
                Ciphersuite::Pib(cs) => cs.generate(ctx, bundle, xmit, idx)?,
                Ciphersuite::Pcb(cs) => cs.generate(ctx, bundle, xmit, idx)?,
                Ciphersuite::Esb(cs) => cs.generate(ctx, bundle, xmit, idx)?,
            }
        }
    }

    // exactly one terminal block, and it is the last on the wire
    let last = xmit.blocks.len() - 1;
    for (idx, block) in xmit.blocks.iter_mut().enumerate() {
        if block.block_type() == BlockType::Primary {
            continue;
        }
        let want = idx == last;
        if block.is_last_block() != want {
            block.rewrite_flags(if want {
                block.flags() | block::flags::LAST_BLOCK
            } else {
                block.flags() & !block::flags::LAST_BLOCK
            });
        }
    }

    // the dictionary is now complete, so the primary can be emitted
    if xmit.find(BlockType::Primary).is_none() {
        let primary = crate::primary::generate(bundle, &mut xmit.dict)
            .map_err(|_| Error::Malformed("primary block generation failed"))?;
        xmit.blocks.insert(0, primary);
    }

    // finalize, in reverse block order
    for idx in (0..xmit.blocks.len()).rev() {
        let Some(csnum) = xmit.blocks[idx].locals.as_ref().map(|l| l.csnum) else {
            continue;
        };
        match ctx.registry.find(csnum)? {
            Ciphersuite::Bab(cs) => cs.finalize(ctx, bundle, xmit, idx)?,
            Ciphersuite::Pib(cs) => cs.finalize(ctx, bundle, xmit, idx)?,
            Ciphersuite::Pcb(cs) => cs.finalize(ctx, bundle, xmit, idx)?,
            Ciphersuite::Esb(cs) => cs.finalize(ctx, bundle, xmit, idx)?,
        }
    }
    Ok(())
}

/// Walks a received block vector, validating every security operation the
/// local node can process: BAB pairs are checked, PCB/ESB families are
/// decrypted and their inner blocks restored in place, PIB signatures are
/// verified.
///
/// Cryptographic mismatches (bad HMAC, bad signature, bad tag) are hard
/// failures. Operations this node has no key for are skipped; the policy
/// layer decides whether that makes the bundle unacceptable.
pub fn validate_in(
    ctx: &SecurityContext,
    bundle: &Bundle,
    recv: &mut BlockList,
) -> Result<ValidationReport, Error> {
    // attach parsed locals to every security block
    for block in recv.blocks.iter_mut() {
        if block.locals.is_some() {
            continue;
        }
        if matches!(
            block.block_type(),
            BlockType::BundleAuthentication
                | BlockType::PayloadIntegrity
                | BlockType::Confidentiality
                | BlockType::ExtensionSecurity
        ) {
            block.locals = Some(BspLocals::parse_block(block)?);
        }
    }

    let mut report = ValidationReport::default();

    // BAB first: the hop-by-hop MAC covers the bundle exactly as received,
    // before any decapsulation rewrites blocks in place.
    for idx in 0..recv.blocks.len() {
        let Some(csnum) = recv.blocks[idx].locals.as_ref().map(|l| l.csnum) else {
            continue;
        };
        if CsKind::of(csnum) == Some(CsKind::Bab) {
            if let Ciphersuite::Bab(cs) = ctx.registry.find(csnum)? {
                cs.validate(ctx, bundle, recv, idx, &mut report)?;
            }
        }
    }

    // PCB and ESB next: later validations must see the restored plaintext
    // blocks. Family leaders are the blocks carrying key-info.
    let mut idx = 0;
    while idx < recv.blocks.len() {
        let leader = recv.blocks[idx].locals.as_ref().is_some_and(|l| {
            matches!(CsKind::of(l.csnum), Some(CsKind::Pcb | CsKind::Esb))
                && l.get_param(tags::KEY_INFO).is_some()
        });
        if leader {
            let csnum = recv.blocks[idx].locals.as_ref().map(|l| l.csnum).unwrap_or(0);
            let ops_before = report.ops.len();
            match ctx.registry.find(csnum)? {
                Ciphersuite::Pcb(cs) => cs.validate(ctx, bundle, recv, idx, &mut report)?,
                Ciphersuite::Esb(cs) => cs.validate(ctx, bundle, recv, idx, &mut report)?,
                _ => return Err(Error::Malformed("key-info on non-confidentiality block")),
            }
            // A restored inner block now sits at this index; it may itself
            // lead a nested family, so look at it again.
            if report.ops.len() > ops_before
                && report.ops[ops_before..]
                    .iter()
                    .any(|op| op.restored.contains(&idx))
            {
                continue;
            }
        }
        idx += 1;
    }

    // PIB signatures last, over the restored vector.
    for idx in 0..recv.blocks.len() {
        let Some(csnum) = recv.blocks[idx].locals.as_ref().map(|l| l.csnum) else {
            continue;
        };
        if CsKind::of(csnum) == Some(CsKind::Pib) {
            if let Ciphersuite::Pib(cs) = ctx.registry.find(csnum)? {
                cs.validate(ctx, bundle, recv, idx, &mut report)?;
            }
        }
    }

    Ok(report)
}
