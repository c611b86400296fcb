//! The security policy database: ordered rule lists deciding which
//! ciphersuites outgoing bundles receive and which protections incoming
//! bundles must prove.

use super::*;

/// An outgoing rule: bundles matching the source/destination patterns get
/// the named ciphersuite applied, addressed to the given security
/// endpoints (`None` means the contextual default: bundle endpoints for
/// end-to-end suites, the hop endpoints for BAB).
#[derive(Debug, Clone)]
pub struct OutRule {
    pub src: EidPattern,
    pub dest: EidPattern,
    pub security_src: Option<Eid>,
    pub security_dest: Option<Eid>,
    pub csnum: u64,
}

/// An incoming rule: bundles matching the source/destination patterns must
/// carry at least one valid security operation drawn from the ciphersuite
/// set, whose endpoints satisfy the security patterns. A null security
/// pattern pins the endpoint to its contextual default.
#[derive(Debug, Clone)]
pub struct InRule {
    pub src: EidPattern,
    pub dest: EidPattern,
    pub security_src: EidPattern,
    pub security_dest: EidPattern,
    pub csnums: Vec<u64>,
}

/// The two ordered rule lists.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    pub outgoing: Vec<OutRule>,
    pub incoming: Vec<InRule>,
}

impl SecurityPolicy {
    /// Applies the outgoing rules to a transmit block vector, calling each
    /// chosen ciphersuite's `prepare` hook. Rules are applied so the
    /// resulting block order is: BAB leader, PCB, PIB, extension blocks,
    /// payload, BAB trailer.
    ///
    /// `next_hop` names the neighbour the bundle is about to be sent to;
    /// it is the default BAB security destination.
    pub fn prepare_out_blocks(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        xmit: &mut BlockList,
        next_hop: Option<&Eid>,
    ) -> Result<(), Error> {
        let matching: Vec<&OutRule> = self
            .outgoing
            .iter()
            .filter(|r| r.src.matches(&bundle.source) && r.dest.matches(&bundle.dest))
            .collect();

        for rule in &matching {
            self.check_consistency(rule, xmit)?;
        }

        // end-to-end integrity first, confidentiality layered outside it
        for rule in &matching {
            if CsKind::of(rule.csnum) == Some(CsKind::Pib) {
                if let Ciphersuite::Pib(cs) = ctx.registry.find(rule.csnum)? {
                    cs.prepare(
                        ctx,
                        bundle,
                        xmit,
                        rule.security_src.clone(),
                        rule.security_dest.clone(),
                    )?;
                }
            }
        }
        for rule in &matching {
            if CsKind::of(rule.csnum) == Some(CsKind::Pcb) {
                if let Ciphersuite::Pcb(cs) = ctx.registry.find(rule.csnum)? {
                    cs.prepare(
                        ctx,
                        bundle,
                        xmit,
                        rule.security_src.clone(),
                        rule.security_dest.clone(),
                    )?;
                }
            }
        }
        for rule in &matching {
            if CsKind::of(rule.csnum) == Some(CsKind::Esb) {
                if let Ciphersuite::Esb(cs) = ctx.registry.find(rule.csnum)? {
                    cs.prepare(
                        ctx,
                        bundle,
                        xmit,
                        rule.security_src.clone(),
                        rule.security_dest.clone(),
                    )?;
                }
            }
        }
        // BAB last so its leader hugs the primary and its trailer the end
        for rule in &matching {
            if CsKind::of(rule.csnum) == Some(CsKind::Bab) {
                if let Ciphersuite::Bab(cs) = ctx.registry.find(rule.csnum)? {
                    let dest = rule
                        .security_dest
                        .clone()
                        .or_else(|| next_hop.cloned());
                    cs.prepare(ctx, bundle, xmit, dest)?;
                }
            }
        }
        Ok(())
    }

    /// A rule demanding a security destination incompatible with an outer
    /// encapsulation already present is a configuration error, not
    /// something to discover on the wire.
    fn check_consistency(&self, rule: &OutRule, xmit: &BlockList) -> Result<(), Error> {
        let Some(want) = &rule.security_dest else {
            return Ok(());
        };
        if !matches!(CsKind::of(rule.csnum), Some(CsKind::Pcb | CsKind::Esb)) {
            return Ok(());
        }
        for block in &xmit.blocks {
            if let Some(locals) = &block.locals {
                if matches!(CsKind::of(locals.csnum), Some(CsKind::Pcb | CsKind::Esb)) {
                    if let Some(outer) = &locals.security_dest {
                        if outer != want {
                            return Err(Error::Inconsistent(
                                "security destination conflicts with existing encapsulation",
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks a received bundle against the incoming rules. Every matching
    /// rule must be satisfied by the validation report; any failure means
    /// the bundle is deleted with reason SECURITY_FAILED.
    pub fn verify_in_policy(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        recv: &BlockList,
        report: &ValidationReport,
    ) -> Result<(), Error> {
        for rule in self
            .incoming
            .iter()
            .filter(|r| r.src.matches(&bundle.source) && r.dest.matches(&bundle.dest))
        {
            let kinds: Vec<CsKind> = {
                let mut kinds: Vec<CsKind> =
                    rule.csnums.iter().filter_map(|c| CsKind::of(*c)).collect();
                kinds.dedup();
                kinds
            };

            for kind in kinds {
                let src_pattern = self.effective_pattern(&rule.security_src, kind, true, bundle, ctx);
                let dest_pattern =
                    self.effective_pattern(&rule.security_dest, kind, false, bundle, ctx);

                let ok = match kind {
                    CsKind::Esb => {
                        self.esb_blocks_covered(recv, &rule.csnums, &src_pattern, &dest_pattern)
                    }
                    kind => report.satisfied(kind, &rule.csnums, &src_pattern, &dest_pattern),
                };
                if !ok {
                    warn!(
                        "bundle from {} fails incoming security rule ({kind:?})",
                        bundle.source
                    );
                    return Err(Error::Failed("incoming security policy unsatisfied"));
                }
            }
        }
        Ok(())
    }

    /// Resolves a null security pattern to its contextual default: the
    /// previous hop / local node for BAB, the bundle endpoints otherwise.
    fn effective_pattern(
        &self,
        pattern: &EidPattern,
        kind: CsKind,
        is_src: bool,
        bundle: &Bundle,
        ctx: &SecurityContext,
    ) -> EidPattern {
        if !pattern.is_null() {
            return pattern.clone();
        }
        let default = match (kind, is_src) {
            (CsKind::Bab, true) => bundle.prevhop.clone(),
            (CsKind::Bab, false) => ctx.local_eid.clone(),
            (_, true) => bundle.source.clone(),
            (_, false) => bundle.dest.clone(),
        };
        EidPattern::Exact(default)
    }

    /// Every ESB-eligible block (the decapsulated ones included) must have
    /// arrived under a satisfying ESB instance. Blocks still typed as ESB
    /// count too: a nested ESB, or one this node lacked the key for, is
    /// only acceptable if an outer layer covered it.
    fn esb_blocks_covered(
        &self,
        recv: &BlockList,
        csnums: &[u64],
        src: &EidPattern,
        dest: &EidPattern,
    ) -> bool {
        recv.blocks
            .iter()
            .filter(|b| {
                matches!(
                    b.block_type(),
                    BlockType::Metadata
                        | BlockType::ExtensionSecurity
                        | BlockType::Unrecognised(_)
                )
            })
            .all(|b| {
                b.protection.iter().any(|p| {
                    csnums.contains(&p.csnum)
                        && src.matches(&p.security_src)
                        && dest.matches(&p.security_dest)
                })
            })
    }
}
