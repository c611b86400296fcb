//! Payload Confidentiality Block ciphersuites: AES-GCM encryption of the
//! payload, and of any other integrity/confidentiality blocks in the same
//! pass, under a KEM-wrapped content-encryption key (CS#3 AES-128 + RSA,
//! CS#7 AES-128 + ECDH P-256, CS#11 AES-256 + ECDH P-384).

use super::*;
use rand::Rng;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy)]
pub struct Pcb {
    csnum: u64,
}

impl Pcb {
    pub fn new(csnum: u64) -> Self {
        debug_assert!(matches!(csnum, 3 | 7 | 11));
        Self { csnum }
    }

    pub fn csnum(&self) -> u64 {
        self.csnum
    }

    /// AES key length in octets: 128-bit for CS#3/7, 256-bit for CS#11.
    pub fn key_len(&self) -> usize {
        if self.csnum == 11 { 32 } else { 16 }
    }

    /// Inserts the leading PCB after the primary and any BAB block.
    pub fn prepare(
        &self,
        _ctx: &SecurityContext,
        _bundle: &Bundle,
        xmit: &mut BlockList,
        security_src: Option<Eid>,
        security_dest: Option<Eid>,
    ) -> Result<(), Error> {
        let mut block = BlockInfo::new(BlockType::Confidentiality);
        let mut locals = BspLocals::new(self.csnum);
        if let Some(src) = security_src {
            locals.set_security_src(src.clone());
            block.add_eid(src);
        }
        if let Some(dest) = security_dest {
            locals.set_security_dest(dest.clone());
            block.add_eid(dest);
        }
        block.locals = Some(locals);
        let pos = xmit.position_after_bab();
        xmit.blocks.insert(pos, block);
        Ok(())
    }

    /// Draws the content-encryption key, salt and IV, KEM-encrypts the key
    /// to the security destination, and serialises the block with 16
    /// octets of result space reserved for the GCM tag. A correlator is
    /// allocated iff other blocks will be encapsulated in this pass.
    pub fn generate(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        xmit: &mut BlockList,
        idx: usize,
    ) -> Result<(), Error> {
        let has_targets = self.targets(xmit, idx).next().is_some();
        let correlator = has_targets.then(|| create_correlator(xmit) | (self.csnum << 16));

        let dest_host = xmit.blocks[idx]
            .locals
            .as_ref()
            .and_then(|l| l.security_dest.as_ref())
            .unwrap_or(&bundle.dest)
            .host()
            .to_string();

        let mut cek = Zeroizing::new(vec![0u8; self.key_len()]);
        let mut salt = [0u8; encap::SALT_LEN];
        rand::rng().fill_bytes(cek.as_mut());
        rand::rng().fill_bytes(&mut salt);
        let iv = encap::fresh_iv();

        let key_info = kem::wrap(ctx.keystore.find_public(&dest_host, self.csnum)?, &cek)?;

        let BlockList { dict, blocks } = xmit;
        let block = &mut blocks[idx];
        let locals = block
            .locals
            .as_mut()
            .ok_or(Error::Malformed("PCB block without locals"))?;
        if let Some(correlator) = correlator {
            locals.set_correlator(correlator);
        }
        locals.add_param(tags::SALT, &salt);
        locals.add_param(tags::IV, &iv);
        locals.add_param(tags::KEY_INFO, &key_info);
        if bundle.is_fragment {
            let mut frag = Vec::new();
            perigee_sdnv::encode_into(bundle.frag_offset, &mut frag);
            perigee_sdnv::encode_into(bundle.orig_length, &mut frag);
            locals.add_param(tags::FRAGMENT, &frag);
        }
        locals.add_result_space(encap::TAG_LEN);
        locals.session_key = Some(cek);

        let data = locals.serialize();
        block
            .generate_preamble(dict, 0, data.len() as u64)
            .map_err(|_| Error::Malformed("PCB preamble generation failed"))?;
        block.append_data(&data);
        Ok(())
    }

    /// Encrypts the payload in place, back-patching the GCM tag into the
    /// reserved result, then replaces every other integrity or
    /// confidentiality block with its encrypted encapsulation under the
    /// shared correlator.
    pub fn finalize(
        &self,
        _ctx: &SecurityContext,
        _bundle: &Bundle,
        xmit: &mut BlockList,
        idx: usize,
    ) -> Result<(), Error> {
        let Some(cek) = xmit.blocks[idx]
            .locals
            .as_ref()
            .and_then(|l| l.session_key.clone())
        else {
            // A correlated member: the leader does all the work.
            return Ok(());
        };
        let (salt, iv, correlator) = {
            let locals = xmit.blocks[idx].locals.as_ref().expect("checked above");
            (
                locals
                    .get_param(tags::SALT)
                    .ok_or(Error::Malformed("PCB without salt"))?
                    .to_vec(),
                locals
                    .get_param(tags::IV)
                    .ok_or(Error::Malformed("PCB without IV"))?
                    .to_vec(),
                locals.correlator,
            )
        };

        // encapsulate the other security blocks first
        let targets: Vec<usize> = self.targets(xmit, idx).collect();
        for target in targets {
            let correlator =
                correlator.ok_or(Error::Malformed("PCB encapsulation without correlator"))?;
            let BlockList { dict, blocks } = &mut *xmit;
            encap::encapsulate_block(
                &mut blocks[target],
                dict,
                encap::EncapSpec {
                    csnum: self.csnum,
                    new_type: BlockType::Confidentiality,
                    correlator: Some(correlator),
                    security_src: None,
                    security_dest: None,
                    key_info: None,
                },
                &cek,
                &salt,
            )?;
        }

        // then the payload, in place
        let payload = xmit
            .find(BlockType::Payload)
            .ok_or(Error::Malformed("bundle has no payload block"))?;
        let mut tag = None;
        let mut gcm_err = None;
        let (off, len) = {
            let p = &xmit.blocks[payload];
            (p.data_offset(), p.data_length() as usize)
        };
        xmit.blocks[payload]
            .mutate(off, len, |buf| {
                match encap::gcm_encrypt_in_place(&cek, &salt, &iv, buf) {
                    Ok(t) => tag = Some(t),
                    Err(e) => gcm_err = Some(e),
                }
            })
            .map_err(|_| Error::Malformed("payload out of range"))?;
        if let Some(e) = gcm_err {
            return Err(e);
        }
        let tag = tag.ok_or(Error::Backend("payload encryption produced no tag".into()))?;

        let mut block = std::mem::take(&mut xmit.blocks[idx]);
        let mut locals = block.locals.take().expect("checked above");
        locals.patch_result(&mut block, tags::ICV, &tag)?;
        block.locals = Some(locals);
        xmit.blocks[idx] = block;
        Ok(())
    }

    /// On the security destination: unwraps the key, restores every
    /// correlated encapsulated block, then decrypts the payload and
    /// verifies its tag.
    pub fn validate(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        recv: &mut BlockList,
        idx: usize,
        report: &mut ValidationReport,
    ) -> Result<(), Error> {
        let (dest_host, security_src, security_dest, salt, iv, correlator, key_info, icv, frag) = {
            let locals = recv.blocks[idx]
                .locals
                .as_ref()
                .ok_or(Error::Malformed("PCB block without locals"))?;
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
                    .ok_or(Error::Malformed("PCB without salt"))?
                    .to_vec(),
                locals
                    .get_param(tags::IV)
                    .ok_or(Error::Malformed("PCB without IV"))?
                    .to_vec(),
                locals.correlator,
                locals
                    .get_param(tags::KEY_INFO)
                    .ok_or(Error::Malformed("PCB without key-info"))?
                    .to_vec(),
                locals
                    .get_result(tags::ICV)
                    .ok_or(Error::Failed("PCB carries no payload ICV"))?
                    .to_vec(),
                locals.get_param(tags::FRAGMENT).map(|f| f.to_vec()),
            )
        };

        if !ctx.keystore.has_private(&dest_host, self.csnum) {
            // Not addressed to this node; leave the family encrypted.
            debug!("PCB {} for {dest_host} is not ours to decrypt", self.csnum);
            return Ok(());
        }
        let cek = kem::unwrap(
            ctx.keystore.find_private(&dest_host, self.csnum)?,
            &key_info,
        )?;

        if let Some(frag) = frag {
            let mut expect = Vec::new();
            perigee_sdnv::encode_into(bundle.frag_offset, &mut expect);
            perigee_sdnv::encode_into(bundle.orig_length, &mut expect);
            if !bundle.is_fragment || frag != expect {
                return Err(Error::Failed("PCB fragment parameter mismatch"));
            }
        }

        // restore the correlated encapsulated blocks
        let mut restored = Vec::new();
        if let Some(correlator) = correlator {
            let members: Vec<usize> = recv
                .blocks
                .iter()
                .enumerate()
                .filter(|(i, b)| {
                    *i != idx
                        && b.block_type() == BlockType::Confidentiality
                        && b.locals.as_ref().is_some_and(|l| {
                            l.correlator == Some(correlator)
                                && l.get_result(tags::ENCAP_BLOCK).is_some()
                        })
                })
                .map(|(i, _)| i)
                .collect();
            for member in members {
                let inner =
                    encap::decapsulate_block(&recv.blocks[member], &recv.dict, &cek, &salt)?;
                let mut inner = inner;
                inner.protection.extend(recv.blocks[member].protection.clone());
                inner.protection.push(metadata::ProtectionInfo {
                    csnum: self.csnum,
                    security_src: security_src.clone(),
                    security_dest: security_dest.clone(),
                });
                recv.blocks[member] = inner;
                restored.push(member);
            }
        }

        // the payload is located last: decrypt a copy, verify, write back
        let payload = recv
            .find(BlockType::Payload)
            .ok_or(Error::Malformed("bundle has no payload block"))?;
        let mut data = recv.blocks[payload].data().to_vec();
        encap::gcm_decrypt_in_place(&cek, &salt, &iv, &mut data, &icv)?;
        let off = recv.blocks[payload].data_offset();
        recv.blocks[payload]
            .mutate(off, data.len(), |buf| buf.copy_from_slice(&data))
            .map_err(|_| Error::Malformed("payload out of range"))?;
        restored.push(payload);

        report.ops.push(ValidatedOp {
            kind: CsKind::Pcb,
            csnum: self.csnum,
            security_src,
            security_dest,
            restored,
        });
        Ok(())
    }

    /// The other integrity/confidentiality blocks this pass encapsulates.
    fn targets<'a>(
        &self,
        xmit: &'a BlockList,
        self_idx: usize,
    ) -> impl Iterator<Item = usize> + 'a {
        xmit.blocks
            .iter()
            .enumerate()
            .filter(move |(i, b)| {
                *i != self_idx
                    && matches!(
                        b.block_type(),
                        BlockType::PayloadIntegrity | BlockType::Confidentiality
                    )
            })
            .map(|(i, _)| i)
    }
}
