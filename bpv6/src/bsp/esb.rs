//! Extension Security Block ciphersuites: AES-GCM encapsulation of
//! extension blocks (everything other than primary, payload, BAB, PCB, PIB
//! and previous-hop), each covered block becoming one ESB (CS#4 AES-128 +
//! RSA, CS#8 AES-128 + ECDH P-256, CS#12 AES-256 + ECDH P-384).
//!
//! When several blocks are protected under one key, exactly one ESB
//! carries the key-info and salt; the rest share its correlator and carry
//! only their own IV and encap-block result.

use super::*;
use rand::Rng;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy)]
pub struct Esb {
    csnum: u64,
}

impl Esb {
    pub fn new(csnum: u64) -> Self {
        debug_assert!(matches!(csnum, 4 | 8 | 12));
        Self { csnum }
    }

    pub fn csnum(&self) -> u64 {
        self.csnum
    }

    pub fn key_len(&self) -> usize {
        if self.csnum == 12 { 32 } else { 16 }
    }

    fn eligible(block_type: BlockType) -> bool {
        !matches!(
            block_type,
            BlockType::Primary
                | BlockType::Payload
                | BlockType::BundleAuthentication
                | BlockType::Confidentiality
                | BlockType::PayloadIntegrity
                | BlockType::PreviousHop
        )
    }

    /// Marks every eligible extension block for encapsulation: the first
    /// becomes the family leader, the rest correlated members. A no-op if
    /// the bundle carries no eligible blocks.
    pub fn prepare(
        &self,
        _ctx: &SecurityContext,
        _bundle: &Bundle,
        xmit: &mut BlockList,
        security_src: Option<Eid>,
        security_dest: Option<Eid>,
    ) -> Result<(), Error> {
        let targets: Vec<usize> = xmit
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.locals.is_none() && Self::eligible(b.block_type()))
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let correlator =
            (targets.len() > 1).then(|| create_correlator(xmit) | (self.csnum << 16));

        // the dictionary must know the security endpoints before the
        // primary block is emitted
        for eid in [&security_src, &security_dest].into_iter().flatten() {
            xmit.dict.add_eid(eid);
        }

        for (seq, target) in targets.into_iter().enumerate() {
            let mut locals = BspLocals::new(self.csnum);
            locals.correlator_seq = seq as u16;
            if let Some(correlator) = correlator {
                locals.set_correlator(correlator);
            }
            if seq == 0 {
                if let Some(src) = &security_src {
                    locals.set_security_src(src.clone());
                }
                if let Some(dest) = &security_dest {
                    locals.set_security_dest(dest.clone());
                }
            }
            xmit.blocks[target].locals = Some(locals);
        }
        Ok(())
    }

    /// The marked blocks are already wire-complete; there is nothing to
    /// serialise until `finalize` replaces them.
    pub fn generate(
        &self,
        _ctx: &SecurityContext,
        _bundle: &Bundle,
        _xmit: &mut BlockList,
        _idx: usize,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// On the family leader: draws the key and salt, KEM-encrypts the key
    /// to the security destination, and replaces each family member with
    /// its encapsulation under a fresh IV.
    pub fn finalize(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        xmit: &mut BlockList,
        idx: usize,
    ) -> Result<(), Error> {
        let (correlator, security_src, security_dest) = {
            let locals = xmit.blocks[idx]
                .locals
                .as_ref()
                .ok_or(Error::Malformed("ESB block without locals"))?;
            if locals.correlator_seq != 0 {
                return Ok(());
            }
            (
                locals.correlator,
                locals.security_src.clone(),
                locals.security_dest.clone(),
            )
        };

        let dest_host = security_dest
            .as_ref()
            .unwrap_or(&bundle.dest)
            .host()
            .to_string();

        let mut cek = Zeroizing::new(vec![0u8; self.key_len()]);
        let mut salt = [0u8; encap::SALT_LEN];
        rand::rng().fill_bytes(cek.as_mut());
        rand::rng().fill_bytes(&mut salt);
        let key_info = kem::wrap(ctx.keystore.find_public(&dest_host, self.csnum)?, &cek)?;

        let members: Vec<usize> = xmit
            .blocks
            .iter()
            .enumerate()
            .filter(|(i, b)| {
                *i != idx
                    && b.locals.as_ref().is_some_and(|l| {
                        l.csnum == self.csnum
                            && l.correlator == correlator
                            && l.correlator_seq != 0
                    })
            })
            .map(|(i, _)| i)
            .collect();

        let BlockList { dict, blocks } = xmit;
        encap::encapsulate_block(
            &mut blocks[idx],
            dict,
            encap::EncapSpec {
                csnum: self.csnum,
                new_type: BlockType::ExtensionSecurity,
                correlator,
                security_src,
                security_dest,
                key_info: Some(&key_info),
            },
            &cek,
            &salt,
        )?;
        for member in members {
            encap::encapsulate_block(
                &mut blocks[member],
                dict,
                encap::EncapSpec {
                    csnum: self.csnum,
                    new_type: BlockType::ExtensionSecurity,
                    correlator,
                    security_src: None,
                    security_dest: None,
                    key_info: None,
                },
                &cek,
                &salt,
            )?;
        }
        Ok(())
    }

    /// On the security destination: unwraps the key and restores every
    /// block of the family, recording a protection entry on each so later
    /// policy evaluation knows what covered it.
    pub fn validate(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        recv: &mut BlockList,
        idx: usize,
        report: &mut ValidationReport,
    ) -> Result<(), Error> {
        let (dest_host, security_src, security_dest, salt, correlator, key_info) = {
            let locals = recv.blocks[idx]
                .locals
                .as_ref()
                .ok_or(Error::Malformed("ESB block without locals"))?;
            (
                locals
                    .security_dest
                    .as_ref()
                    .unwrap_or(&bundle.dest)
                    .host()
                    .to_string(),
                locals
                    .security_src
                    .clone()
                    .unwrap_or_else(|| bundle.source.clone()),
                locals
                    .security_dest
                    .clone()
                    .unwrap_or_else(|| bundle.dest.clone()),
                locals
                    .get_param(tags::SALT)
                    .ok_or(Error::Malformed("ESB without salt"))?
                    .to_vec(),
                locals.correlator,
                locals
                    .get_param(tags::KEY_INFO)
                    .ok_or(Error::Malformed("ESB without key-info"))?
                    .to_vec(),
            )
        };

        if !ctx.keystore.has_private(&dest_host, self.csnum) {
            debug!("ESB {} for {dest_host} is not ours to decrypt", self.csnum);
            return Ok(());
        }
        let cek = kem::unwrap(
            ctx.keystore.find_private(&dest_host, self.csnum)?,
            &key_info,
        )?;

        let mut family = vec![idx];
        if let Some(correlator) = correlator {
            family.extend(
                recv.blocks
                    .iter()
                    .enumerate()
                    .filter(|(i, b)| {
                        *i != idx
                            && b.block_type() == BlockType::ExtensionSecurity
                            && b.locals.as_ref().is_some_and(|l| {
                                l.correlator == Some(correlator)
                                    && l.get_result(tags::ENCAP_BLOCK).is_some()
                            })
                    })
                    .map(|(i, _)| i),
            );
        }

        let mut restored = Vec::new();
        for member in family {
            let mut inner =
                encap::decapsulate_block(&recv.blocks[member], &recv.dict, &cek, &salt)?;
            inner
                .protection
                .extend(recv.blocks[member].protection.clone());
            inner.protection.push(metadata::ProtectionInfo {
                csnum: self.csnum,
                security_src: security_src.clone(),
                security_dest: security_dest.clone(),
            });
            recv.blocks[member] = inner;
            restored.push(member);
        }

        report.ops.push(ValidatedOp {
            kind: CsKind::Esb,
            csnum: self.csnum,
            security_src,
            security_dest,
            restored,
        });
        Ok(())
    }
}
