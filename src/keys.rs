//! Importing, exporting and validating the asymmetric keys used for HTTP signatures
//!
//! Keys move between servers in several encodings: PEM (SPKI or PKCS#1) inside
//! actor documents, JWK in some key endpoints, and Multibase/Multicodec in
//! Multikey documents. This module converts between all of them and a pair of
//! typed wrappers, [PublicKey] and [PrivateKey], which the signature dialects
//! consume.

use crate::error::Error;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as Base64Url, Engine};
use pkcs8::{spki::SubjectPublicKeyInfoRef, Document, LineEnding, ObjectIdentifier};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    traits::{PrivateKeyParts, PublicKeyParts},
    BigUint, RsaPrivateKey, RsaPublicKey,
};
use serde_json::{json, Value};
use signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use std::fmt::{Debug, Formatter};

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// Multicodec code for an RSA public key (PKCS#1 DER payload).
const MULTICODEC_RSA_PUB: u64 = 0x1205;
/// Multicodec code for an Ed25519 public key (raw 32 byte payload).
const MULTICODEC_ED25519_PUB: u64 = 0xed;

/// Signature algorithm tags supported by the two HTTP signature dialects.
///
/// Import, export and signing cover the RSA and Ed25519 members. The ECDSA
/// tags exist so that signature parameters naming them parse and format
/// correctly, but importing such a key fails with
/// [Error::UnsupportedAlgorithm].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RsaSha256,
    /// RSASSA-PKCS1-v1_5 with SHA-512
    RsaSha512,
    /// RSA-PSS with SHA-512
    RsaPssSha512,
    /// ECDSA over P-256 with SHA-256 (recognized, not implemented)
    EcdsaP256Sha256,
    /// ECDSA over P-384 with SHA-384 (recognized, not implemented)
    EcdsaP384Sha384,
    /// Ed25519
    Ed25519,
}

impl KeyAlgorithm {
    /// The algorithm name used in RFC 9421 signature parameters.
    pub fn rfc9421_name(self) -> &'static str {
        match self {
            KeyAlgorithm::RsaSha256 => "rsa-v1_5-sha256",
            KeyAlgorithm::RsaSha512 => "rsa-v1_5-sha512",
            KeyAlgorithm::RsaPssSha512 => "rsa-pss-sha512",
            KeyAlgorithm::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            KeyAlgorithm::EcdsaP384Sha384 => "ecdsa-p384-sha384",
            KeyAlgorithm::Ed25519 => "ed25519",
        }
    }

    /// Parse an RFC 9421 algorithm name.
    pub fn from_rfc9421_name(name: &str) -> Option<KeyAlgorithm> {
        Some(match name {
            "rsa-v1_5-sha256" => KeyAlgorithm::RsaSha256,
            "rsa-v1_5-sha512" => KeyAlgorithm::RsaSha512,
            "rsa-pss-sha512" => KeyAlgorithm::RsaPssSha512,
            "ecdsa-p256-sha256" => KeyAlgorithm::EcdsaP256Sha256,
            "ecdsa-p384-sha384" => KeyAlgorithm::EcdsaP384Sha384,
            "ed25519" => KeyAlgorithm::Ed25519,
            _ => return None,
        })
    }

    fn jwk_alg(self) -> &'static str {
        match self {
            KeyAlgorithm::RsaSha256 => "RS256",
            KeyAlgorithm::RsaSha512 => "RS512",
            KeyAlgorithm::RsaPssSha512 => "PS512",
            KeyAlgorithm::EcdsaP256Sha256 => "ES256",
            KeyAlgorithm::EcdsaP384Sha384 => "ES384",
            KeyAlgorithm::Ed25519 => "EdDSA",
        }
    }
}

/// What a key is about to be used for, checked by [PublicKey::validate] and
/// [PrivateKey::validate] before any crypto operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyUse {
    /// Producing signatures; requires a private half.
    Sign,
    /// Checking signatures.
    Verify,
}

#[derive(Clone)]
#[allow(clippy::large_enum_variant)]
enum PublicMaterial {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

/// A public key plus its algorithm tag.
#[derive(Clone)]
pub struct PublicKey {
    algorithm: KeyAlgorithm,
    material: PublicMaterial,
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm
            && match (&self.material, &other.material) {
                (PublicMaterial::Rsa(a), PublicMaterial::Rsa(b)) => a == b,
                (PublicMaterial::Ed25519(a), PublicMaterial::Ed25519(b)) => a == b,
                _ => false,
            }
    }
}

impl PublicKey {
    /// The algorithm this key signs or verifies under.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Replace the algorithm tag, keeping the key material.
    ///
    /// RSA keys carry no hash choice in their encoding, so callers that know
    /// a peer signs with SHA-512 retag the imported key with this.
    pub fn with_algorithm(mut self, algorithm: KeyAlgorithm) -> Result<PublicKey, Error> {
        let compatible = matches!(
            (&self.material, algorithm),
            (
                PublicMaterial::Rsa(_),
                KeyAlgorithm::RsaSha256 | KeyAlgorithm::RsaSha512 | KeyAlgorithm::RsaPssSha512
            ) | (PublicMaterial::Ed25519(_), KeyAlgorithm::Ed25519)
        );
        if !compatible {
            return Err(Error::UnsupportedAlgorithm);
        }
        self.algorithm = algorithm;
        Ok(self)
    }

    /// Import a PEM public key, autodetecting SPKI (`PUBLIC KEY`) vs
    /// PKCS#1 (`RSA PUBLIC KEY`).
    pub fn import_pem(pem: &str) -> Result<PublicKey, Error> {
        let (label, doc) = Document::from_pem(pem).map_err(|_| Error::InvalidKeyEncoding)?;
        match label {
            "PUBLIC KEY" => Self::import_spki_der(doc.as_bytes()),
            "RSA PUBLIC KEY" => Self::import_pkcs1_der(doc.as_bytes()),
            _ => Err(Error::InvalidKeyEncoding),
        }
    }

    /// Import a DER-encoded SubjectPublicKeyInfo structure.
    pub fn import_spki_der(der: &[u8]) -> Result<PublicKey, Error> {
        let spki =
            SubjectPublicKeyInfoRef::try_from(der).map_err(|_| Error::InvalidKeyEncoding)?;
        let oid = spki.algorithm.oid;
        if oid == OID_RSA_ENCRYPTION {
            let key =
                RsaPublicKey::from_public_key_der(der).map_err(|_| Error::InvalidKeyEncoding)?;
            Ok(PublicKey {
                algorithm: KeyAlgorithm::RsaSha256,
                material: PublicMaterial::Rsa(key),
            })
        } else if oid == OID_ED25519 {
            let key = ed25519_dalek::VerifyingKey::from_public_key_der(der)
                .map_err(|_| Error::InvalidKeyEncoding)?;
            Ok(PublicKey {
                algorithm: KeyAlgorithm::Ed25519,
                material: PublicMaterial::Ed25519(key),
            })
        } else {
            Err(Error::UnsupportedAlgorithm)
        }
    }

    /// Import a DER-encoded PKCS#1 RSA public key.
    pub fn import_pkcs1_der(der: &[u8]) -> Result<PublicKey, Error> {
        let key = RsaPublicKey::from_pkcs1_der(der).map_err(|_| Error::InvalidKeyEncoding)?;
        Ok(PublicKey {
            algorithm: KeyAlgorithm::RsaSha256,
            material: PublicMaterial::Rsa(key),
        })
    }

    /// Import a JWK object (`kty` RSA or OKP/Ed25519).
    pub fn import_jwk(jwk: &Value) -> Result<PublicKey, Error> {
        match jwk.get("kty").and_then(Value::as_str) {
            Some("RSA") => {
                let n = jwk_biguint(jwk, "n")?;
                let e = jwk_biguint(jwk, "e")?;
                let key = RsaPublicKey::new(n, e).map_err(|_| Error::InvalidKeyEncoding)?;
                Ok(PublicKey {
                    algorithm: KeyAlgorithm::RsaSha256,
                    material: PublicMaterial::Rsa(key),
                })
            }
            Some("OKP") => {
                if jwk.get("crv").and_then(Value::as_str) != Some("Ed25519") {
                    return Err(Error::UnsupportedAlgorithm);
                }
                let x = jwk_bytes(jwk, "x")?;
                let x: [u8; 32] = x.try_into().map_err(|_| Error::InvalidKeyEncoding)?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&x)
                    .map_err(|_| Error::InvalidKeyEncoding)?;
                Ok(PublicKey {
                    algorithm: KeyAlgorithm::Ed25519,
                    material: PublicMaterial::Ed25519(key),
                })
            }
            Some("EC") => Err(Error::UnsupportedAlgorithm),
            _ => Err(Error::InvalidKeyEncoding),
        }
    }

    /// Import a Multibase/Multicodec public key (`z...`, base58btc).
    pub fn import_multibase(multibase: &str) -> Result<PublicKey, Error> {
        let rest = multibase
            .strip_prefix('z')
            .ok_or(Error::InvalidKeyEncoding)?;
        let bytes = bs58::decode(rest)
            .into_vec()
            .map_err(|_| Error::InvalidKeyEncoding)?;
        let (codec, payload) = read_varint(&bytes)?;
        match codec {
            MULTICODEC_RSA_PUB => Self::import_pkcs1_der(payload),
            MULTICODEC_ED25519_PUB => {
                let raw: [u8; 32] = payload.try_into().map_err(|_| Error::InvalidKeyEncoding)?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|_| Error::InvalidKeyEncoding)?;
                Ok(PublicKey {
                    algorithm: KeyAlgorithm::Ed25519,
                    material: PublicMaterial::Ed25519(key),
                })
            }
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }

    /// Export as PEM SPKI, wrapped at 64 columns.
    pub fn to_pem(&self) -> Result<String, Error> {
        match &self.material {
            PublicMaterial::Rsa(key) => key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|_| Error::InvalidKeyEncoding),
            PublicMaterial::Ed25519(key) => key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|_| Error::InvalidKeyEncoding),
        }
    }

    /// Export as a JWK object.
    pub fn to_jwk(&self) -> Result<Value, Error> {
        Ok(match &self.material {
            PublicMaterial::Rsa(key) => json!({
                "kty": "RSA",
                "alg": self.algorithm.jwk_alg(),
                "n": Base64Url.encode(key.n().to_bytes_be()),
                "e": Base64Url.encode(key.e().to_bytes_be()),
                "key_ops": ["verify"],
                "ext": true,
            }),
            PublicMaterial::Ed25519(key) => json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "alg": self.algorithm.jwk_alg(),
                "x": Base64Url.encode(key.as_bytes()),
                "key_ops": ["verify"],
                "ext": true,
            }),
        })
    }

    /// Export as a base58btc multibase string with the multicodec prefix.
    pub fn to_multibase(&self) -> Result<String, Error> {
        let (codec, payload) = match &self.material {
            PublicMaterial::Rsa(key) => (
                MULTICODEC_RSA_PUB,
                key.to_pkcs1_der()
                    .map_err(|_| Error::InvalidKeyEncoding)?
                    .as_bytes()
                    .to_vec(),
            ),
            PublicMaterial::Ed25519(key) => {
                (MULTICODEC_ED25519_PUB, key.as_bytes().to_vec())
            }
        };
        let mut bytes = write_varint(codec);
        bytes.extend_from_slice(&payload);
        Ok(format!("z{}", bs58::encode(bytes).into_string()))
    }

    /// Check that this key may be used as `key_use`.
    pub fn validate(&self, key_use: KeyUse) -> Result<(), Error> {
        match key_use {
            KeyUse::Sign => Err(Error::InvalidKeyUse(
                "signing requires a private key, this key is public-only",
            )),
            KeyUse::Verify => Ok(()),
        }
    }

    /// Verify `signature` over `message`. Returns false for a well-formed but
    /// wrong signature, an error only for unusable keys.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool, Error> {
        match (&self.material, self.algorithm) {
            (PublicMaterial::Rsa(key), KeyAlgorithm::RsaSha256) => {
                let key = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(key.clone());
                Ok(rsa::pkcs1v15::Signature::try_from(signature)
                    .map(|sig| key.verify(message, &sig).is_ok())
                    .unwrap_or(false))
            }
            (PublicMaterial::Rsa(key), KeyAlgorithm::RsaSha512) => {
                let key = rsa::pkcs1v15::VerifyingKey::<sha2::Sha512>::new(key.clone());
                Ok(rsa::pkcs1v15::Signature::try_from(signature)
                    .map(|sig| key.verify(message, &sig).is_ok())
                    .unwrap_or(false))
            }
            (PublicMaterial::Rsa(key), KeyAlgorithm::RsaPssSha512) => {
                let key = rsa::pss::VerifyingKey::<sha2::Sha512>::new(key.clone());
                Ok(rsa::pss::Signature::try_from(signature)
                    .map(|sig| key.verify(message, &sig).is_ok())
                    .unwrap_or(false))
            }
            (PublicMaterial::Ed25519(key), KeyAlgorithm::Ed25519) => {
                Ok(ed25519_dalek::Signature::from_slice(signature)
                    .map(|sig| key.verify(message, &sig).is_ok())
                    .unwrap_or(false))
            }
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }
}

#[derive(Clone)]
enum PrivateMaterial {
    Rsa(Box<RsaPrivateKey>),
    Ed25519(Box<ed25519_dalek::SigningKey>),
}

/// A private key plus its algorithm tag.
#[derive(Clone)]
pub struct PrivateKey {
    algorithm: KeyAlgorithm,
    material: PrivateMaterial,
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    /// The algorithm this key signs under.
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Import a PEM private key, autodetecting PKCS#8 (`PRIVATE KEY`) vs
    /// PKCS#1 (`RSA PRIVATE KEY`).
    pub fn import_pem(pem: &str) -> Result<PrivateKey, Error> {
        let (label, _) = Document::from_pem(pem).map_err(|_| Error::InvalidKeyEncoding)?;
        match label {
            "PRIVATE KEY" => {
                if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
                    return Ok(PrivateKey {
                        algorithm: KeyAlgorithm::RsaSha256,
                        material: PrivateMaterial::Rsa(Box::new(key)),
                    });
                }
                let key = ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
                    .map_err(|_| Error::InvalidKeyEncoding)?;
                Ok(PrivateKey {
                    algorithm: KeyAlgorithm::Ed25519,
                    material: PrivateMaterial::Ed25519(Box::new(key)),
                })
            }
            "RSA PRIVATE KEY" => {
                let key =
                    RsaPrivateKey::from_pkcs1_pem(pem).map_err(|_| Error::InvalidKeyEncoding)?;
                Ok(PrivateKey {
                    algorithm: KeyAlgorithm::RsaSha256,
                    material: PrivateMaterial::Rsa(Box::new(key)),
                })
            }
            _ => Err(Error::InvalidKeyEncoding),
        }
    }

    /// Import a private JWK object.
    pub fn import_jwk(jwk: &Value) -> Result<PrivateKey, Error> {
        match jwk.get("kty").and_then(Value::as_str) {
            Some("RSA") => {
                let n = jwk_biguint(jwk, "n")?;
                let e = jwk_biguint(jwk, "e")?;
                let d = jwk_biguint(jwk, "d")?;
                let p = jwk_biguint(jwk, "p")?;
                let q = jwk_biguint(jwk, "q")?;
                let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
                    .map_err(|_| Error::InvalidKeyEncoding)?;
                Ok(PrivateKey {
                    algorithm: KeyAlgorithm::RsaSha256,
                    material: PrivateMaterial::Rsa(Box::new(key)),
                })
            }
            Some("OKP") => {
                if jwk.get("crv").and_then(Value::as_str) != Some("Ed25519") {
                    return Err(Error::UnsupportedAlgorithm);
                }
                let d = jwk_bytes(jwk, "d")?;
                let d: [u8; 32] = d.try_into().map_err(|_| Error::InvalidKeyEncoding)?;
                Ok(PrivateKey {
                    algorithm: KeyAlgorithm::Ed25519,
                    material: PrivateMaterial::Ed25519(Box::new(
                        ed25519_dalek::SigningKey::from_bytes(&d),
                    )),
                })
            }
            Some("EC") => Err(Error::UnsupportedAlgorithm),
            _ => Err(Error::InvalidKeyEncoding),
        }
    }

    /// Export as PEM PKCS#8.
    pub fn to_pem(&self) -> Result<String, Error> {
        match &self.material {
            PrivateMaterial::Rsa(key) => key
                .to_pkcs8_pem(LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(|_| Error::InvalidKeyEncoding),
            PrivateMaterial::Ed25519(key) => key
                .to_pkcs8_pem(LineEnding::LF)
                .map(|pem| pem.to_string())
                .map_err(|_| Error::InvalidKeyEncoding),
        }
    }

    /// Export as a private JWK object.
    pub fn to_jwk(&self) -> Result<Value, Error> {
        Ok(match &self.material {
            PrivateMaterial::Rsa(key) => {
                let primes = key.primes();
                if primes.len() < 2 {
                    return Err(Error::InvalidKeyEncoding);
                }
                json!({
                    "kty": "RSA",
                    "alg": self.algorithm.jwk_alg(),
                    "n": Base64Url.encode(key.n().to_bytes_be()),
                    "e": Base64Url.encode(key.e().to_bytes_be()),
                    "d": Base64Url.encode(key.d().to_bytes_be()),
                    "p": Base64Url.encode(primes[0].to_bytes_be()),
                    "q": Base64Url.encode(primes[1].to_bytes_be()),
                    "key_ops": ["sign"],
                    "ext": true,
                })
            }
            PrivateMaterial::Ed25519(key) => json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "alg": self.algorithm.jwk_alg(),
                "x": Base64Url.encode(key.verifying_key().as_bytes()),
                "d": Base64Url.encode(key.to_bytes()),
                "key_ops": ["sign"],
                "ext": true,
            }),
        })
    }

    /// The corresponding public key, carrying the same algorithm tag.
    pub fn public_key(&self) -> PublicKey {
        match &self.material {
            PrivateMaterial::Rsa(key) => PublicKey {
                algorithm: self.algorithm,
                material: PublicMaterial::Rsa(key.to_public_key()),
            },
            PrivateMaterial::Ed25519(key) => PublicKey {
                algorithm: self.algorithm,
                material: PublicMaterial::Ed25519(key.verifying_key()),
            },
        }
    }

    /// Check that this key may be used as `key_use`.
    pub fn validate(&self, _key_use: KeyUse) -> Result<(), Error> {
        match self.algorithm {
            KeyAlgorithm::EcdsaP256Sha256 | KeyAlgorithm::EcdsaP384Sha384 => {
                Err(Error::UnsupportedAlgorithm)
            }
            _ => Ok(()),
        }
    }

    /// Sign `message`, returning the raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        match (&self.material, self.algorithm) {
            (PrivateMaterial::Rsa(key), KeyAlgorithm::RsaSha256) => {
                let key = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new((**key).clone());
                Ok(key.sign(message).to_vec())
            }
            (PrivateMaterial::Rsa(key), KeyAlgorithm::RsaSha512) => {
                let key = rsa::pkcs1v15::SigningKey::<sha2::Sha512>::new((**key).clone());
                Ok(key.sign(message).to_vec())
            }
            (PrivateMaterial::Rsa(key), KeyAlgorithm::RsaPssSha512) => {
                let key = rsa::pss::SigningKey::<sha2::Sha512>::new((**key).clone());
                Ok(key.sign_with_rng(&mut rand::thread_rng(), message).to_vec())
            }
            (PrivateMaterial::Ed25519(key), KeyAlgorithm::Ed25519) => {
                Ok(key.sign(message).to_vec())
            }
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }
}

/// A private/public key pair in PEM format, as stored alongside an actor.
#[derive(Debug, Clone)]
pub struct Keypair {
    /// Private key in PEM (PKCS#8) format
    pub private_key: String,
    /// Public key in PEM (SPKI) format
    pub public_key: String,
}

impl Keypair {
    /// Parse the private half into a typed key.
    pub fn private_key(&self) -> Result<PrivateKey, Error> {
        PrivateKey::import_pem(&self.private_key)
    }
}

/// Generate a random 2048 bit RSA keypair for ActivityPub HTTP signatures.
pub fn generate_rsa_keypair() -> Result<Keypair, Error> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| Error::other(anyhow::anyhow!(e)))?;
    let private_key = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|_| Error::InvalidKeyEncoding)?
        .to_string();
    let public_key = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| Error::InvalidKeyEncoding)?;
    Ok(Keypair {
        private_key,
        public_key,
    })
}

/// Generate a random Ed25519 keypair.
pub fn generate_ed25519_keypair() -> Result<Keypair, Error> {
    let key = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
    let private_key = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|_| Error::InvalidKeyEncoding)?
        .to_string();
    let public_key = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| Error::InvalidKeyEncoding)?;
    Ok(Keypair {
        private_key,
        public_key,
    })
}

fn jwk_bytes(jwk: &Value, field: &str) -> Result<Vec<u8>, Error> {
    let s = jwk
        .get(field)
        .and_then(Value::as_str)
        .ok_or(Error::InvalidKeyEncoding)?;
    Base64Url.decode(s).map_err(|_| Error::InvalidKeyEncoding)
}

fn jwk_biguint(jwk: &Value, field: &str) -> Result<BigUint, Error> {
    Ok(BigUint::from_bytes_be(&jwk_bytes(jwk, field)?))
}

/// Read an unsigned LEB128 varint, returning (value, remaining bytes).
fn read_varint(bytes: &[u8]) -> Result<(u64, &[u8]), Error> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, byte) in bytes.iter().enumerate() {
        if shift >= 63 {
            return Err(Error::InvalidKeyEncoding);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, &bytes[i + 1..]));
        }
        shift += 7;
    }
    Err(Error::InvalidKeyEncoding)
}

fn write_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}
