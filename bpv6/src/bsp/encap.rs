//! Shared AES-GCM machinery for the confidentiality suites: payload
//! encryption in place, and whole-block encapsulation/decapsulation.
//!
//! The GCM nonce is always the 4-octet salt followed by an 8-octet IV, and
//! the additional-authenticated-data is empty.

use super::*;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce, Tag};
use rand::Rng;

pub(crate) const SALT_LEN: usize = 4;
pub(crate) const IV_LEN: usize = 8;
pub(crate) const TAG_LEN: usize = 16;

fn nonce(salt: &[u8], iv: &[u8]) -> Result<[u8; 12], Error> {
    if salt.len() != SALT_LEN || iv.len() != IV_LEN {
        return Err(Error::Malformed("bad salt or IV length"));
    }
    let mut n = [0u8; 12];
    n[..SALT_LEN].copy_from_slice(salt);
    n[SALT_LEN..].copy_from_slice(iv);
    Ok(n)
}

pub(crate) fn fresh_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    iv
}

pub(crate) fn gcm_encrypt_in_place(
    cek: &[u8],
    salt: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_LEN], Error> {
    let nonce = nonce(salt, iv)?;
    let tag = match cek.len() {
        16 => Aes128Gcm::new_from_slice(cek)
            .map_err(|e| Error::Backend(e.to_string()))?
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], buf),
        32 => Aes256Gcm::new_from_slice(cek)
            .map_err(|e| Error::Backend(e.to_string()))?
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], buf),
        _ => return Err(Error::Malformed("bad content-encryption key length")),
    }
    .map_err(|e| Error::Backend(e.to_string()))?;
    Ok(tag.into())
}

pub(crate) fn gcm_decrypt_in_place(
    cek: &[u8],
    salt: &[u8],
    iv: &[u8],
    buf: &mut [u8],
    tag: &[u8],
) -> Result<(), Error> {
    if tag.len() != TAG_LEN {
        return Err(Error::Malformed("bad ICV length"));
    }
    let nonce = nonce(salt, iv)?;
    match cek.len() {
        16 => Aes128Gcm::new_from_slice(cek)
            .map_err(|e| Error::Backend(e.to_string()))?
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), &[], buf, Tag::from_slice(tag)),
        32 => Aes256Gcm::new_from_slice(cek)
            .map_err(|e| Error::Backend(e.to_string()))?
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), &[], buf, Tag::from_slice(tag)),
        _ => return Err(Error::Malformed("bad content-encryption key length")),
    }
    .map_err(|_| Error::Failed("authentication tag mismatch"))
}

/// How an encapsulating block presents itself on the wire.
pub(crate) struct EncapSpec<'a> {
    pub csnum: u64,
    pub new_type: BlockType,
    pub correlator: Option<u64>,
    /// Leader-only: the security endpoints carried as EID references.
    pub security_src: Option<Eid>,
    pub security_dest: Option<Eid>,
    /// Leader-only: the wrapped content-encryption key; its presence also
    /// makes the block carry the salt parameter.
    pub key_info: Option<&'a [u8]>,
}

/// Replaces `target` in place with its encrypted encapsulation: the whole
/// serialised block (preamble and content) is GCM-encrypted under a fresh
/// IV, the type is rewritten, and the ciphertext plus tag becomes the
/// encap-block security result.
pub(crate) fn encapsulate_block(
    target: &mut BlockInfo,
    dict: &mut Dictionary,
    spec: EncapSpec,
    cek: &[u8],
    salt: &[u8],
) -> Result<(), Error> {
    let iv = fresh_iv();
    let mut ciphertext = target.contents().to_vec();
    let tag = gcm_encrypt_in_place(cek, salt, &iv, &mut ciphertext)?;
    ciphertext.extend_from_slice(&tag);

    let mut locals = BspLocals::new(spec.csnum);
    if let Some(correlator) = spec.correlator {
        locals.set_correlator(correlator);
    }

    let mut eids = Vec::new();
    if let Some(src) = spec.security_src {
        locals.set_security_src(src.clone());
        eids.push(src);
    }
    if let Some(dest) = spec.security_dest {
        locals.set_security_dest(dest.clone());
        eids.push(dest);
    }

    if let Some(key_info) = spec.key_info {
        locals.add_param(tags::SALT, salt);
        locals.add_param(tags::IV, &iv);
        locals.add_param(tags::KEY_INFO, key_info);
    } else {
        locals.add_param(tags::IV, &iv);
    }
    locals.add_result(tags::ENCAP_BLOCK, &ciphertext);
    if spec.key_info.is_none() {
        locals.correlator_seq = 1;
    }

    let keep = target.flags()
        & (block::flags::REPLICATE
            | block::flags::REPORT_ONERROR
            | block::flags::DISCARD_BUNDLE_ONERROR
            | block::flags::DISCARD_BLOCK_ONERROR);

    let data = locals.serialize();
    let protection = std::mem::take(&mut target.protection);
    let mut replacement = BlockInfo::new(spec.new_type);
    replacement.set_eid_list(eids);
    replacement
        .generate_preamble(dict, keep, data.len() as u64)
        .map_err(|_| Error::Malformed("encapsulation preamble generation failed"))?;
    replacement.append_data(&data);
    replacement.locals = Some(locals);
    replacement.protection = protection;
    *target = replacement;
    Ok(())
}

/// Reverses [`encapsulate_block`]: decrypts the encap-block result and
/// reconstructs the inner block from its own preamble and content. The
/// outer block's EID references (security endpoints) belong to the outer
/// block and are discarded; the inner block's references are resolved
/// against the bundle dictionary.
pub(crate) fn decapsulate_block(
    block: &BlockInfo,
    dict: &Dictionary,
    cek: &[u8],
    salt: &[u8],
) -> Result<BlockInfo, Error> {
    let locals = block
        .locals
        .as_ref()
        .ok_or(Error::Malformed("encapsulating block without locals"))?;
    let iv = locals
        .get_param(tags::IV)
        .ok_or(Error::Malformed("encapsulating block without IV"))?;
    let encap = locals
        .get_result(tags::ENCAP_BLOCK)
        .ok_or(Error::Malformed("encapsulating block without encap-block"))?;
    if encap.len() < TAG_LEN {
        return Err(Error::Malformed("encap-block shorter than its tag"));
    }

    let (ciphertext, tag) = encap.split_at(encap.len() - TAG_LEN);
    let mut plaintext = ciphertext.to_vec();
    gcm_decrypt_in_place(cek, salt, iv, &mut plaintext, tag)?;

    let mut inner = BlockInfo::default();
    let consumed = inner
        .consume(&plaintext)
        .map_err(|_| Error::Failed("decrypted block is unintelligible"))?;
    if !inner.complete() || consumed != plaintext.len() {
        return Err(Error::Failed("decrypted block is unintelligible"));
    }
    inner
        .resolve_eid_refs(dict)
        .map_err(|_| Error::Failed("decrypted block references unknown EIDs"))?;

    if matches!(
        inner.block_type(),
        BlockType::BundleAuthentication
            | BlockType::PayloadIntegrity
            | BlockType::Confidentiality
            | BlockType::ExtensionSecurity
    ) {
        inner.locals = Some(BspLocals::parse_block(&inner)?);
    }
    Ok(inner)
}
