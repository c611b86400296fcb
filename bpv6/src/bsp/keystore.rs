use super::*;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use std::io::BufReader;
use x509_cert::der::{Decode, Encode};
use zeroize::Zeroizing;

/// Key material held by the store.
pub enum Key {
    /// A raw shared key for BAB HMACs.
    Symmetric(Zeroizing<Vec<u8>>),
    RsaPublic(rsa::RsaPublicKey),
    RsaPrivate(rsa::RsaPrivateKey),
    P256Public(p256::PublicKey),
    P256Private(p256::SecretKey),
    P384Public(p384::PublicKey),
    P384Private(p384::SecretKey),
}

impl Key {
    fn is_public(&self) -> bool {
        matches!(
            self,
            Key::RsaPublic(_) | Key::P256Public(_) | Key::P384Public(_)
        )
    }

    fn is_private(&self) -> bool {
        matches!(
            self,
            Key::RsaPrivate(_) | Key::P256Private(_) | Key::P384Private(_)
        )
    }
}

struct Entry {
    host: String,
    csnum: u64,
    key: Key,
}

/// The HMAC output length a BAB ciphersuite requires of its keys.
pub fn bab_key_len(csnum: u64) -> Option<usize> {
    match csnum {
        1 => Some(20),
        5 => Some(32),
        9 => Some(48),
        _ => None,
    }
}

/// An ordered list of keys indexed by `(host, ciphersuite-number)`.
///
/// Lookup is first-match; entries with the wildcard host `"*"` always sort
/// after exact hosts, so a wildcard acts as a fallback no matter the
/// insertion order.
#[derive(Default)]
pub struct KeyStore {
    entries: Vec<Entry>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key. A symmetric key for a BAB ciphersuite must match the
    /// suite's HMAC output length exactly (20 for SHA-1, 32 for SHA-256,
    /// 48 for SHA-384).
    pub fn add(&mut self, host: &str, csnum: u64, key: Key) -> Result<(), Error> {
        if let (Some(want), Key::Symmetric(bytes)) = (bab_key_len(csnum), &key) {
            if bytes.len() != want {
                return Err(Error::BadKey {
                    host: host.to_string(),
                    reason: "BAB key length does not match ciphersuite HMAC length",
                });
            }
        }
        self.entries.push(Entry {
            host: host.to_string(),
            csnum,
            key,
        });
        self.entries.sort_by_key(|e| e.host == "*");
        Ok(())
    }

    pub fn add_symmetric(&mut self, host: &str, csnum: u64, key: &[u8]) -> Result<(), Error> {
        self.add(host, csnum, Key::Symmetric(Zeroizing::new(key.to_vec())))
    }

    /// Loads a public key for `(host, csnum)` from a PEM file holding
    /// either an X.509 certificate or a bare SubjectPublicKeyInfo.
    pub fn add_public_key_file(
        &mut self,
        host: &str,
        csnum: u64,
        path: &std::path::Path,
    ) -> Result<(), Error> {
        let mut reader = BufReader::new(
            std::fs::File::open(path).map_err(|e| Error::Backend(e.to_string()))?,
        );
        for item in rustls_pemfile::read_all(&mut reader) {
            let spki_der = match item.map_err(|e| Error::Backend(e.to_string()))? {
                rustls_pemfile::Item::X509Certificate(der) => {
                    let cert = x509_cert::Certificate::from_der(der.as_ref())
                        .map_err(|e| Error::Backend(e.to_string()))?;
                    cert.tbs_certificate
                        .subject_public_key_info
                        .to_der()
                        .map_err(|e| Error::Backend(e.to_string()))?
                }
                rustls_pemfile::Item::SubjectPublicKeyInfo(der) => der.as_ref().to_vec(),
                _ => continue,
            };
            let key = match csnum {
                2 | 3 | 4 => Key::RsaPublic(
                    rsa::RsaPublicKey::from_public_key_der(&spki_der)
                        .map_err(|e| Error::Backend(e.to_string()))?,
                ),
                6 | 7 | 8 => Key::P256Public(
                    p256::PublicKey::from_public_key_der(&spki_der)
                        .map_err(|e| Error::Backend(e.to_string()))?,
                ),
                10 | 11 | 12 => Key::P384Public(
                    p384::PublicKey::from_public_key_der(&spki_der)
                        .map_err(|e| Error::Backend(e.to_string()))?,
                ),
                _ => return Err(Error::UnknownCiphersuite(csnum)),
            };
            return self.add(host, csnum, key);
        }
        Err(Error::BadKey {
            host: host.to_string(),
            reason: "no usable public key in PEM file",
        })
    }

    /// Loads a private key for `(host, csnum)` from a PEM file (PKCS#8,
    /// PKCS#1 or SEC1).
    pub fn add_private_key_file(
        &mut self,
        host: &str,
        csnum: u64,
        path: &std::path::Path,
    ) -> Result<(), Error> {
        let mut reader = BufReader::new(
            std::fs::File::open(path).map_err(|e| Error::Backend(e.to_string()))?,
        );
        for item in rustls_pemfile::read_all(&mut reader) {
            let key = match item.map_err(|e| Error::Backend(e.to_string()))? {
                rustls_pemfile::Item::Pkcs8Key(der) => match csnum {
                    2 | 3 | 4 => Key::RsaPrivate(
                        rsa::RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der())
                            .map_err(|e| Error::Backend(e.to_string()))?,
                    ),
                    6 | 7 | 8 => Key::P256Private(
                        p256::SecretKey::from_pkcs8_der(der.secret_pkcs8_der())
                            .map_err(|e| Error::Backend(e.to_string()))?,
                    ),
                    10 | 11 | 12 => Key::P384Private(
                        p384::SecretKey::from_pkcs8_der(der.secret_pkcs8_der())
                            .map_err(|e| Error::Backend(e.to_string()))?,
                    ),
                    _ => return Err(Error::UnknownCiphersuite(csnum)),
                },
                rustls_pemfile::Item::Pkcs1Key(der) => Key::RsaPrivate(
                    rsa::RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
                        .map_err(|e| Error::Backend(e.to_string()))?,
                ),
                rustls_pemfile::Item::Sec1Key(der) => match csnum {
                    6 | 7 | 8 => Key::P256Private(
                        p256::SecretKey::from_sec1_der(der.secret_sec1_der())
                            .map_err(|e| Error::Backend(e.to_string()))?,
                    ),
                    10 | 11 | 12 => Key::P384Private(
                        p384::SecretKey::from_sec1_der(der.secret_sec1_der())
                            .map_err(|e| Error::Backend(e.to_string()))?,
                    ),
                    _ => return Err(Error::UnknownCiphersuite(csnum)),
                },
                _ => continue,
            };
            return self.add(host, csnum, key);
        }
        Err(Error::BadKey {
            host: host.to_string(),
            reason: "no usable private key in PEM file",
        })
    }

    fn find(&self, host: &str, csnum: u64, pred: impl Fn(&Key) -> bool) -> Option<&Key> {
        self.entries
            .iter()
            .find(|e| e.csnum == csnum && (e.host == host || e.host == "*") && pred(&e.key))
            .map(|e| &e.key)
    }

    pub fn find_symmetric(&self, host: &str, csnum: u64) -> Result<&[u8], Error> {
        match self.find(host, csnum, |k| matches!(k, Key::Symmetric(_))) {
            Some(Key::Symmetric(bytes)) => Ok(bytes),
            _ => Err(Error::KeyNotFound {
                host: host.to_string(),
                csnum,
            }),
        }
    }

    pub fn find_public(&self, host: &str, csnum: u64) -> Result<&Key, Error> {
        self.find(host, csnum, Key::is_public)
            .ok_or(Error::KeyNotFound {
                host: host.to_string(),
                csnum,
            })
    }

    pub fn find_private(&self, host: &str, csnum: u64) -> Result<&Key, Error> {
        self.find(host, csnum, Key::is_private)
            .ok_or(Error::KeyNotFound {
                host: host.to_string(),
                csnum,
            })
    }

    /// True if any private key is registered for `(host, csnum)`.
    pub fn has_private(&self, host: &str, csnum: u64) -> bool {
        self.find(host, csnum, Key::is_private).is_some()
    }
}
