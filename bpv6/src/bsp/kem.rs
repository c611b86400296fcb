//! Content-encryption-key transport for the confidentiality suites.
//!
//! CS#3/4 wrap the CEK with RSA-OAEP over SHA-256. CS#7/8/11/12 use an
//! ephemeral-static ECDH agreement: the key-info value is the SDNV-prefixed
//! SEC1 encoding of the ephemeral public point followed by the AES-key-wrapped
//! CEK, with the KEK derived from the shared secret by HKDF-SHA256.

use super::*;
use keystore::Key;
use zeroize::Zeroizing;

const KDF_INFO: &[u8] = b"perigee-ecdh-kem";

fn derive_kek(shared: &[u8], kek: &mut [u8]) -> Result<(), Error> {
    hkdf::Hkdf::<sha2::Sha256>::new(None, shared)
        .expand(KDF_INFO, kek)
        .map_err(|e| Error::Backend(e.to_string()))
}

fn kw_wrap(kek: &[u8], cek: &[u8]) -> Result<Vec<u8>, Error> {
    match kek.len() {
        16 => aes_kw::KekAes128::try_from(kek).and_then(|kek| kek.wrap_vec(cek)),
        32 => aes_kw::KekAes256::try_from(kek).and_then(|kek| kek.wrap_vec(cek)),
        _ => unreachable!(),
    }
    .map_err(|e| Error::Backend(e.to_string()))
}

fn kw_unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, Error> {
    match kek.len() {
        16 => aes_kw::KekAes128::try_from(kek).and_then(|kek| kek.unwrap_vec(wrapped)),
        32 => aes_kw::KekAes256::try_from(kek).and_then(|kek| kek.unwrap_vec(wrapped)),
        _ => unreachable!(),
    }
    .map_err(|_| Error::Failed("key unwrap failed"))
}

/// Encrypts `cek` to the holder of `key`, producing the key-info value.
pub(crate) fn wrap(key: &Key, cek: &[u8]) -> Result<Vec<u8>, Error> {
    let mut rng = rand::rng();
    match key {
        Key::RsaPublic(pk) => pk
            .encrypt(&mut rng, rsa::Oaep::<sha2::Sha256>::new(), cek)
            .map_err(|e| Error::Backend(e.to_string())),
        Key::P256Public(pk) => {
            let eph = p256::ecdh::EphemeralSecret::random(&mut rng);
            let point = p256::Sec1Point::from(&eph.public_key());
            let shared = eph.diffie_hellman(pk);
            let mut kek = Zeroizing::new([0u8; 16]);
            derive_kek(shared.raw_secret_bytes(), kek.as_mut())?;

            let mut out = Vec::new();
            perigee_sdnv::encode_into(point.as_bytes().len() as u64, &mut out);
            out.extend_from_slice(point.as_bytes());
            out.extend_from_slice(&kw_wrap(kek.as_ref(), cek)?);
            Ok(out)
        }
        Key::P384Public(pk) => {
            let eph = p384::ecdh::EphemeralSecret::random(&mut rng);
            let point = p384::Sec1Point::from(&eph.public_key());
            let shared = eph.diffie_hellman(pk);
            let mut kek = Zeroizing::new([0u8; 32]);
            derive_kek(shared.raw_secret_bytes(), kek.as_mut())?;

            let mut out = Vec::new();
            perigee_sdnv::encode_into(point.as_bytes().len() as u64, &mut out);
            out.extend_from_slice(point.as_bytes());
            out.extend_from_slice(&kw_wrap(kek.as_ref(), cek)?);
            Ok(out)
        }
        _ => Err(Error::BadKey {
            host: String::new(),
            reason: "key transport requires a public key",
        }),
    }
}

/// Recovers a CEK from a key-info value using the local private key.
pub(crate) fn unwrap(key: &Key, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    match key {
        Key::RsaPrivate(sk) => sk
            .decrypt(rsa::Oaep::<sha2::Sha256>::new(), blob)
            .map(Zeroizing::new)
            .map_err(|_| Error::Failed("key transport decryption failed")),
        Key::P256Private(sk) => {
            let (point_len, n) = perigee_sdnv::decode(blob)
                .map_err(|_| Error::Malformed("bad key-info"))?
                .ok_or(Error::Malformed("truncated key-info"))?;
            let point_len = point_len as usize;
            let point = blob
                .get(n..n + point_len)
                .ok_or(Error::Malformed("truncated key-info point"))?;
            let eph = p256::PublicKey::from_sec1_bytes(point)
                .map_err(|e| Error::Backend(e.to_string()))?;
            let shared =
                p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), eph.as_affine());
            let mut kek = Zeroizing::new([0u8; 16]);
            derive_kek(shared.raw_secret_bytes(), kek.as_mut())?;
            kw_unwrap(kek.as_ref(), &blob[n + point_len..]).map(Zeroizing::new)
        }
        Key::P384Private(sk) => {
            let (point_len, n) = perigee_sdnv::decode(blob)
                .map_err(|_| Error::Malformed("bad key-info"))?
                .ok_or(Error::Malformed("truncated key-info"))?;
            let point_len = point_len as usize;
            let point = blob
                .get(n..n + point_len)
                .ok_or(Error::Malformed("truncated key-info point"))?;
            let eph = p384::PublicKey::from_sec1_bytes(point)
                .map_err(|e| Error::Backend(e.to_string()))?;
            let shared =
                p384::ecdh::diffie_hellman(sk.to_nonzero_scalar(), eph.as_affine());
            let mut kek = Zeroizing::new([0u8; 32]);
            derive_kek(shared.raw_secret_bytes(), kek.as_mut())?;
            kw_unwrap(kek.as_ref(), &blob[n + point_len..]).map(Zeroizing::new)
        }
        _ => Err(Error::BadKey {
            host: String::new(),
            reason: "key transport requires a private key",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdh_round_trip() {
        let mut rng = rand::rng();
        let sk = p256::SecretKey::random(&mut rng);
        let pk = sk.public_key();

        let cek = [0x42u8; 16];
        let blob = wrap(&Key::P256Public(pk), &cek).unwrap();
        let recovered = unwrap(&Key::P256Private(sk), &blob).unwrap();
        assert_eq!(recovered.as_slice(), &cek);
    }

    #[test]
    fn tampered_wrap_fails() {
        let mut rng = rand::rng();
        let sk = p384::SecretKey::random(&mut rng);
        let pk = sk.public_key();

        let cek = [0x17u8; 32];
        let mut blob = wrap(&Key::P384Public(pk), &cek).unwrap();
        *blob.last_mut().unwrap() ^= 0x01;
        assert!(unwrap(&Key::P384Private(sk), &blob).is_err());
    }
}
