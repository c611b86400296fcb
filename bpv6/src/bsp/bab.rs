//! Bundle Authentication Block ciphersuites: hop-by-hop HMACs covering the
//! whole bundle (CS#1 HMAC-SHA1, CS#5 HMAC-SHA256, CS#9 HMAC-SHA384).
//!
//! BAB travels as a correlated pair: a leading block just after the
//! primary, and a trailing block at the very end of the bundle carrying the
//! ICV, so the MAC can cover every preceding octet.

use super::*;
use hmac::{KeyInit, Mac};

enum BabMac {
    Sha1(hmac::Hmac<sha1::Sha1>),
    Sha256(hmac::Hmac<sha2::Sha256>),
    Sha384(hmac::Hmac<sha2::Sha384>),
}

impl BabMac {
    fn new(csnum: u64, key: &[u8]) -> Result<Self, Error> {
        let bad = |e: hmac::digest::InvalidLength| Error::Backend(e.to_string());
        match csnum {
            1 => hmac::Hmac::new_from_slice(key).map(Self::Sha1).map_err(bad),
            5 => hmac::Hmac::new_from_slice(key)
                .map(Self::Sha256)
                .map_err(bad),
            9 => hmac::Hmac::new_from_slice(key)
                .map(Self::Sha384)
                .map_err(bad),
            _ => Err(Error::UnknownCiphersuite(csnum)),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(m) => m.update(data),
            Self::Sha256(m) => m.update(data),
            Self::Sha384(m) => m.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(m) => m.finalize().into_bytes().to_vec(),
            Self::Sha256(m) => m.finalize().into_bytes().to_vec(),
            Self::Sha384(m) => m.finalize().into_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bab {
    csnum: u64,
}

impl Bab {
    pub fn new(csnum: u64) -> Self {
        debug_assert!(matches!(csnum, 1 | 5 | 9));
        Self { csnum }
    }

    pub fn csnum(&self) -> u64 {
        self.csnum
    }

    /// The HMAC output length in octets.
    pub fn result_len(&self) -> usize {
        keystore::bab_key_len(self.csnum).unwrap_or(0)
    }

    /// Inserts the correlated pair: a leading block immediately after the
    /// primary and a trailing block at the end of the vector.
    pub fn prepare(
        &self,
        ctx: &SecurityContext,
        _bundle: &Bundle,
        xmit: &mut BlockList,
        security_dest: Option<Eid>,
    ) -> Result<(), Error> {
        let mut correlator = create_correlator(xmit);
        correlator |= self.csnum << 16;

        let mut leading = BlockInfo::new(BlockType::BundleAuthentication);
        let mut locals = BspLocals::new(self.csnum);
        locals.set_correlator(correlator);
        locals.set_security_src(ctx.local_eid.clone());
        leading.add_eid(ctx.local_eid.clone());
        if let Some(dest) = security_dest {
            locals.set_security_dest(dest.clone());
            leading.add_eid(dest);
        }
        leading.locals = Some(locals);
        let pos = xmit.position_after_primary();
        xmit.blocks.insert(pos, leading);

        let mut trailing = BlockInfo::new(BlockType::BundleAuthentication);
        let mut locals = BspLocals::new(self.csnum);
        locals.set_correlator(correlator);
        locals.correlator_seq = 1;
        trailing.locals = Some(locals);
        xmit.blocks.push(trailing);
        Ok(())
    }

    /// Serialises both blocks of the pair, reserving ICV space in the
    /// trailing one.
    pub fn generate(
        &self,
        _ctx: &SecurityContext,
        _bundle: &Bundle,
        xmit: &mut BlockList,
        idx: usize,
    ) -> Result<(), Error> {
        let result_len = self.result_len();
        let BlockList { dict, blocks } = xmit;
        let block = &mut blocks[idx];
        let locals = block
            .locals
            .as_mut()
            .ok_or(Error::Malformed("BAB block without locals"))?;

        if locals.correlator_seq == 1 {
            locals.add_result_space(result_len);
        }
        let data = locals.serialize();
        block
            .generate_preamble(dict, 0, data.len() as u64)
            .map_err(|_| Error::Malformed("BAB preamble generation failed"))?;
        block.append_data(&data);
        Ok(())
    }

    /// On the leading block: computes the HMAC over the whole bundle and
    /// back-patches it into the trailing block's reserved result.
    pub fn finalize(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        xmit: &mut BlockList,
        idx: usize,
    ) -> Result<(), Error> {
        let locals = xmit.blocks[idx]
            .locals
            .as_ref()
            .ok_or(Error::Malformed("BAB block without locals"))?;
        if locals.correlator_seq != 0 {
            return Ok(());
        }
        let correlator = locals.correlator;
        let host = locals
            .security_dest
            .as_ref()
            .unwrap_or(&bundle.dest)
            .host()
            .to_string();

        let key = ctx.keystore.find_symmetric(&host, self.csnum)?;
        let mac = self.create_digest(key, xmit)?;

        let trailing = xmit
            .blocks
            .iter()
            .position(|b| {
                b.block_type() == BlockType::BundleAuthentication
                    && b.locals
                        .as_ref()
                        .is_some_and(|l| l.correlator == correlator && l.correlator_seq == 1)
            })
            .ok_or(Error::Malformed("missing trailing BAB block"))?;

        let mut block = std::mem::take(&mut xmit.blocks[trailing]);
        let mut locals = block.locals.take().expect("trailing BAB locals");
        locals.patch_result(&mut block, tags::SIGNATURE, &mac)?;
        block.locals = Some(locals);
        xmit.blocks[trailing] = block;
        Ok(())
    }

    /// On the leading block of a received pair: recomputes the HMAC and
    /// compares it to the trailing block's result.
    pub fn validate(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        recv: &BlockList,
        idx: usize,
        report: &mut ValidationReport,
    ) -> Result<(), Error> {
        let locals = recv.blocks[idx]
            .locals
            .as_ref()
            .ok_or(Error::Malformed("BAB block without locals"))?;
        if locals.get_result(tags::SIGNATURE).is_some() {
            // The trailing block: handled by its leading partner.
            return Ok(());
        }
        let correlator = locals.correlator;

        let trailing = recv
            .blocks
            .iter()
            .enumerate()
            .find(|(i, b)| {
                *i != idx
                    && b.block_type() == BlockType::BundleAuthentication
                    && b.locals.as_ref().is_some_and(|l| {
                        l.correlator == correlator && l.get_result(tags::SIGNATURE).is_some()
                    })
            })
            .map(|(_, b)| b)
            .ok_or(Error::Failed("BAB pair has no result block"))?;

        let received = trailing
            .locals
            .as_ref()
            .and_then(|l| l.get_result(tags::SIGNATURE))
            .ok_or(Error::Failed("BAB pair has no result block"))?;

        let host = locals
            .security_src
            .as_ref()
            .unwrap_or(&bundle.prevhop)
            .host()
            .to_string();
        let key = ctx.keystore.find_symmetric(&host, self.csnum)?;

        let computed = self.create_digest(key, recv)?;
        if computed != received {
            info!("BAB {} HMAC mismatch from {host}", self.csnum);
            return Err(Error::Failed("BAB HMAC mismatch"));
        }

        report.ops.push(ValidatedOp {
            kind: CsKind::Bab,
            csnum: self.csnum,
            security_src: locals
                .security_src
                .clone()
                .unwrap_or_else(|| bundle.prevhop.clone()),
            security_dest: locals
                .security_dest
                .clone()
                .unwrap_or_else(|| ctx.local_eid.clone()),
            restored: Vec::new(),
        });
        Ok(())
    }

    /// The HMAC covers, in block order: the primary's full wire octets;
    /// for every other block its type octet, its full flags value as eight
    /// big-endian octets with EID_REFS forced off, then the wire octets
    /// from after the flags SDNV to the end of the block — except that a
    /// result-bearing BAB block is covered only up to the end of its
    /// security parameters.
    fn create_digest(&self, key: &[u8], list: &BlockList) -> Result<Vec<u8>, Error> {
        let mut mac = BabMac::new(self.csnum, key)?;

        for block in &list.blocks {
            if block.block_type() == BlockType::Primary {
                mac.update(block.contents());
                continue;
            }

            let contents = block.contents();
            mac.update(&contents[..1]);
            let flags_len = perigee_sdnv::len(&contents[1..])
                .ok_or(Error::Malformed("truncated block flags"))?;
            let offset = 1 + flags_len;
            mac.update(&(block.flags() & !block::flags::EID_REFS).to_be_bytes());

            let mut len = block.full_length() - offset;
            if block.block_type() == BlockType::BundleAuthentication {
                if let Some(result_off) = BspLocals::result_field_offset(block.data())? {
                    len = block.data_offset() + result_off - offset;
                }
            }
            block
                .process(offset, len, |d| mac.update(d))
                .map_err(|_| Error::Malformed("short block content"))?;
        }
        Ok(mac.finalize())
    }
}
