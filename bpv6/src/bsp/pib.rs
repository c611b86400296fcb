//! Payload Integrity Block ciphersuites: end-to-end signatures over the
//! mutable canonical form (CS#2 RSA/SHA-256, CS#6 ECDSA-P256/SHA-256,
//! CS#10 ECDSA-P384/SHA-384).

use super::*;
use keystore::Key;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use rsa::traits::PublicKeyParts;
use sha2::Digest;

enum PibHash {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
}

impl PibHash {
    fn new(csnum: u64) -> Result<Self, Error> {
        match csnum {
            2 | 6 => Ok(Self::Sha256(sha2::Sha256::new())),
            10 => Ok(Self::Sha384(sha2::Sha384::new())),
            _ => Err(Error::UnknownCiphersuite(csnum)),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pib {
    csnum: u64,
}

impl Pib {
    pub fn new(csnum: u64) -> Self {
        debug_assert!(matches!(csnum, 2 | 6 | 10));
        Self { csnum }
    }

    pub fn csnum(&self) -> u64 {
        self.csnum
    }

    /// Inserts the PIB after the primary and any BAB blocks.
    pub fn prepare(
        &self,
        _ctx: &SecurityContext,
        _bundle: &Bundle,
        xmit: &mut BlockList,
        security_src: Option<Eid>,
        security_dest: Option<Eid>,
    ) -> Result<(), Error> {
        let mut block = BlockInfo::new(BlockType::PayloadIntegrity);
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

    /// Serialises the block, reserving result space sized for the eventual
    /// signature.
    pub fn generate(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        xmit: &mut BlockList,
        idx: usize,
    ) -> Result<(), Error> {
        let sig_len = {
            let locals = xmit.blocks[idx]
                .locals
                .as_ref()
                .ok_or(Error::Malformed("PIB block without locals"))?;
            let host = locals
                .security_src
                .as_ref()
                .unwrap_or(&bundle.source)
                .host()
                .to_string();
            self.signature_len(ctx, &host)?
        };

        let BlockList { dict, blocks } = xmit;
        let block = &mut blocks[idx];
        let locals = block.locals.as_mut().expect("checked above");
        locals.add_result_space(sig_len);
        let data = locals.serialize();
        block
            .generate_preamble(dict, 0, data.len() as u64)
            .map_err(|_| Error::Malformed("PIB preamble generation failed"))?;
        block.append_data(&data);
        Ok(())
    }

    /// Computes the canonical digest, signs it, and back-patches the
    /// signature into the reserved result slot.
    pub fn finalize(
        &self,
        ctx: &SecurityContext,
        bundle: &Bundle,
        xmit: &mut BlockList,
        idx: usize,
    ) -> Result<(), Error> {
        let digest = self.create_digest(bundle, xmit, idx)?;
        let host = xmit.blocks[idx]
            .locals
            .as_ref()
            .and_then(|l| l.security_src.as_ref())
            .unwrap_or(&bundle.source)
            .host()
            .to_string();

        let signature = match ctx.keystore.find_private(&host, self.csnum)? {
            Key::RsaPrivate(sk) => sk
                .sign(rsa::Pkcs1v15Sign::new::<sha2::Sha256>(), &digest)
                .map_err(|e| Error::Backend(e.to_string()))?,
            Key::P256Private(sk) => {
                let sig: p256::ecdsa::Signature = p256::ecdsa::SigningKey::from(sk)
                    .sign_prehash(&digest)
                    .map_err(|e| Error::Backend(e.to_string()))?;
                sig.to_bytes().to_vec()
            }
            Key::P384Private(sk) => {
                let sig: p384::ecdsa::Signature = p384::ecdsa::SigningKey::from(sk)
                    .sign_prehash(&digest)
                    .map_err(|e| Error::Backend(e.to_string()))?;
                sig.to_bytes().to_vec()
            }
            _ => {
                return Err(Error::BadKey {
                    host,
                    reason: "signing requires a private key",
                });
            }
        };

        let mut block = std::mem::take(&mut xmit.blocks[idx]);
        let mut locals = block.locals.take().expect("checked above");
        locals.patch_result(&mut block, tags::SIGNATURE, &signature)?;
        block.locals = Some(locals);
        xmit.blocks[idx] = block;
        Ok(())
    }

    /// Recomputes the canonical digest and verifies the embedded signature.
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
            .ok_or(Error::Malformed("PIB block without locals"))?;
        let signature = locals
            .get_result(tags::SIGNATURE)
            .ok_or(Error::Failed("PIB block carries no signature"))?;

        let digest = self.create_digest(bundle, recv, idx)?;
        let host = locals
            .security_src
            .as_ref()
            .unwrap_or(&bundle.source)
            .host()
            .to_string();

        let ok = match ctx.keystore.find_public(&host, self.csnum)? {
            Key::RsaPublic(pk) => pk
                .verify(rsa::Pkcs1v15Sign::new::<sha2::Sha256>(), &digest, signature)
                .is_ok(),
            Key::P256Public(pk) => p256::ecdsa::Signature::from_slice(signature)
                .is_ok_and(|sig| {
                    p256::ecdsa::VerifyingKey::from(pk)
                        .verify_prehash(&digest, &sig)
                        .is_ok()
                }),
            Key::P384Public(pk) => p384::ecdsa::Signature::from_slice(signature)
                .is_ok_and(|sig| {
                    p384::ecdsa::VerifyingKey::from(pk)
                        .verify_prehash(&digest, &sig)
                        .is_ok()
                }),
            _ => false,
        };
        if !ok {
            info!("PIB {} signature verification failed from {host}", self.csnum);
            return Err(Error::Failed("PIB signature invalid"));
        }

        report.ops.push(ValidatedOp {
            kind: CsKind::Pib,
            csnum: self.csnum,
            security_src: locals
                .security_src
                .clone()
                .unwrap_or_else(|| bundle.source.clone()),
            security_dest: locals
                .security_dest
                .clone()
                .unwrap_or_else(|| bundle.dest.clone()),
            restored: Vec::new(),
        });
        Ok(())
    }

    fn signature_len(&self, ctx: &SecurityContext, host: &str) -> Result<usize, Error> {
        match self.csnum {
            2 => match ctx.keystore.find_private(host, 2)? {
                Key::RsaPrivate(sk) => Ok(sk.size()),
                _ => Err(Error::BadKey {
                    host: host.to_string(),
                    reason: "CS#2 requires an RSA private key",
                }),
            },
            6 => Ok(64),
            10 => Ok(96),
            _ => Err(Error::UnknownCiphersuite(self.csnum)),
        }
    }

    /// The signed digest covers the canonical primary, the PIB itself in
    /// abstract form, every later PIB/PCB block, and the payload.
    fn create_digest(
        &self,
        bundle: &Bundle,
        list: &BlockList,
        self_idx: usize,
    ) -> Result<Vec<u8>, Error> {
        let mut hash = PibHash::new(self.csnum)?;
        let mut sink = |d: &[u8]| hash.update(d);

        canonical::primary(bundle, &mut sink);
        for idx in 0..list.blocks.len() {
            if idx < self_idx {
                continue;
            }
            if idx == self_idx {
                canonical::block(list, idx, true, self.csnum, &mut sink)?;
                continue;
            }
            match list.blocks[idx].block_type() {
                BlockType::PayloadIntegrity
                | BlockType::Confidentiality
                | BlockType::Payload => {
                    canonical::block(list, idx, false, self.csnum, &mut sink)?;
                }
                _ => {}
            }
        }
        drop(sink);
        Ok(hash.finalize())
    }
}
