//! Flattened JWS parsing and verification, JWK conversion and thumbprints
//!
//! Only `RS256` (RSA PKCS#1 v1.5 with SHA-256) and `ES256` (ECDSA P-256 with
//! SHA-256, raw 64-byte `r || s` signature) are accepted. The signing input
//! is the ASCII of `protected || "." || payload` exactly as transmitted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

const P256_COORDINATE_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwsError {
    #[error("malformed JWS: {0}")]
    Malformed(String),

    #[error("Invalid nonce")]
    BadNonce,

    #[error("JWS url does not match the request URL")]
    UrlMismatch,

    #[error("unsupported key: {0}")]
    UnsupportedKey(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("JWS signature does not verify")]
    BadSignature,

    #[error("account not found")]
    AccountNotFound,
}

/// Flattened JSON serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Public JSON Web Key (RSA or EC P-256)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn b64_decode(field: &str, value: &str) -> Result<Vec<u8>, JwsError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| JwsError::Malformed(format!("{field} is not base64url")))
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, JwsError> {
    value
        .as_deref()
        .ok_or_else(|| JwsError::UnsupportedKey(format!("missing {field}")))
}

impl Jwk {
    pub fn from_public_key<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self, JwsError> {
        let err = |e: openssl::error::ErrorStack| JwsError::UnsupportedKey(e.to_string());
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa().map_err(err)?;
                Ok(Jwk {
                    kty: "RSA".into(),
                    crv: None,
                    x: None,
                    y: None,
                    n: Some(b64(&rsa.n().to_vec())),
                    e: Some(b64(&rsa.e().to_vec())),
                })
            }
            Id::EC => {
                let ec = key.ec_key().map_err(err)?;
                if ec.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
                    return Err(JwsError::UnsupportedKey("only P-256 is supported".into()));
                }
                let mut ctx = BigNumContext::new().map_err(err)?;
                let mut x = BigNum::new().map_err(err)?;
                let mut y = BigNum::new().map_err(err)?;
                ec.public_key()
                    .affine_coordinates(ec.group(), &mut x, &mut y, &mut ctx)
                    .map_err(err)?;
                Ok(Jwk {
                    kty: "EC".into(),
                    crv: Some("P-256".into()),
                    x: Some(b64(&x.to_vec_padded(P256_COORDINATE_LEN as i32).map_err(err)?)),
                    y: Some(b64(&y.to_vec_padded(P256_COORDINATE_LEN as i32).map_err(err)?)),
                    n: None,
                    e: None,
                })
            }
            other => Err(JwsError::UnsupportedKey(format!("key type {other:?}"))),
        }
    }

    /// Convert to an OpenSSL public key
    ///
    /// # Errors
    /// [`JwsError::UnsupportedKey`] on a missing member, an unknown `kty` or
    /// a curve other than P-256.
    pub fn to_public_key(&self) -> Result<PKey<Public>, JwsError> {
        let err = |e: openssl::error::ErrorStack| JwsError::UnsupportedKey(e.to_string());
        match self.kty.as_str() {
            "RSA" => {
                let n = BigNum::from_slice(&b64_decode("n", required("n", &self.n)?)?).map_err(err)?;
                let e = BigNum::from_slice(&b64_decode("e", required("e", &self.e)?)?).map_err(err)?;
                let rsa = Rsa::from_public_components(n, e).map_err(err)?;
                PKey::from_rsa(rsa).map_err(err)
            }
            "EC" => {
                if required("crv", &self.crv)? != "P-256" {
                    return Err(JwsError::UnsupportedKey(format!(
                        "curve {:?} is not supported",
                        self.crv
                    )));
                }
                let x = b64_decode("x", required("x", &self.x)?)?;
                let y = b64_decode("y", required("y", &self.y)?)?;
                if x.len() != P256_COORDINATE_LEN || y.len() != P256_COORDINATE_LEN {
                    return Err(JwsError::UnsupportedKey("P-256 coordinates must be 32 bytes".into()));
                }
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).map_err(err)?;
                let x = BigNum::from_slice(&x).map_err(err)?;
                let y = BigNum::from_slice(&y).map_err(err)?;
                let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y).map_err(err)?;
                ec.check_key().map_err(err)?;
                PKey::from_ec_key(ec).map_err(err)
            }
            other => Err(JwsError::UnsupportedKey(format!("kty {other:?}"))),
        }
    }

    /// RFC 7638 thumbprint: SHA-256 over the required members in
    /// lexicographic order, base64url without padding
    pub fn thumbprint(&self) -> Result<String, JwsError> {
        let canonical = match self.kty.as_str() {
            "RSA" => format!(
                r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
                required("e", &self.e)?,
                required("n", &self.n)?
            ),
            "EC" => format!(
                r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                required("crv", &self.crv)?,
                required("x", &self.x)?,
                required("y", &self.y)?
            ),
            other => return Err(JwsError::UnsupportedKey(format!("kty {other:?}"))),
        };
        Ok(b64(&Sha256::digest(canonical.as_bytes())))
    }
}

/// `token || "." || thumbprint(jwk)`
pub fn key_authorization(token: &str, jwk: &Jwk) -> Result<String, JwsError> {
    Ok(format!("{}.{}", token, jwk.thumbprint()?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// A parsed, not yet verified JWS
#[derive(Debug, Clone)]
pub struct JwsRequest {
    pub header: ProtectedHeader,
    protected_b64: String,
    payload_b64: String,
    signature: Vec<u8>,
}

/// A JWS whose signature checked out
#[derive(Debug)]
pub struct Verified {
    pub header: ProtectedHeader,
    pub payload: Vec<u8>,
    pub key: PKey<Public>,
}

impl Verified {
    /// POST-as-GET requests carry an empty payload
    pub fn is_post_as_get(&self) -> bool {
        self.payload.is_empty()
    }

    /// Deserialize the payload; an empty payload reads as `{}`
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, JwsError> {
        let bytes: &[u8] = if self.payload.is_empty() { b"{}" } else { &self.payload };
        serde_json::from_slice(bytes).map_err(|e| JwsError::Malformed(format!("payload: {e}")))
    }
}

impl JwsRequest {
    /// Decode the flattened JSON and its protected header
    pub fn parse(body: &[u8]) -> Result<Self, JwsError> {
        let jws: FlattenedJws = serde_json::from_slice(body)
            .map_err(|e| JwsError::Malformed(format!("body is not a flattened JWS: {e}")))?;
        let header_bytes = b64_decode("protected", &jws.protected)?;
        let header: ProtectedHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| JwsError::Malformed(format!("protected header: {e}")))?;
        if header.jwk.is_some() == header.kid.is_some() {
            return Err(JwsError::Malformed(
                "exactly one of jwk and kid must be present".into(),
            ));
        }
        // validate the payload encoding up front
        b64_decode("payload", &jws.payload)?;
        Ok(Self {
            header,
            signature: b64_decode("signature", &jws.signature)?,
            protected_b64: jws.protected,
            payload_b64: jws.payload,
        })
    }

    fn signing_input(&self) -> String {
        format!("{}.{}", self.protected_b64, self.payload_b64)
    }

    /// Check the signature against `key`
    pub fn verify_signature(&self, key: &PKeyRef<Public>) -> Result<(), JwsError> {
        let input = self.signing_input();
        let ok = match (self.header.alg.as_str(), key.id()) {
            ("RS256", Id::RSA) => {
                let mut verifier = Verifier::new(MessageDigest::sha256(), key)
                    .map_err(|_| JwsError::BadSignature)?;
                verifier
                    .update(input.as_bytes())
                    .map_err(|_| JwsError::BadSignature)?;
                verifier.verify(&self.signature).unwrap_or(false)
            }
            ("ES256", Id::EC) => {
                if self.signature.len() != 2 * P256_COORDINATE_LEN {
                    return Err(JwsError::BadSignature);
                }
                let (r, s) = self.signature.split_at(P256_COORDINATE_LEN);
                let sig = BigNum::from_slice(r)
                    .and_then(|r| BigNum::from_slice(s).map(|s| (r, s)))
                    .and_then(|(r, s)| EcdsaSig::from_private_components(r, s))
                    .map_err(|_| JwsError::BadSignature)?;
                let ec = key.ec_key().map_err(|_| JwsError::BadSignature)?;
                let digest = Sha256::digest(input.as_bytes());
                sig.verify(&digest, &ec).unwrap_or(false)
            }
            ("RS256" | "ES256", _) => {
                return Err(JwsError::UnsupportedAlgorithm(format!(
                    "{} does not match the key type",
                    self.header.alg
                )))
            }
            (other, _) => return Err(JwsError::UnsupportedAlgorithm(other.to_string())),
        };
        if ok {
            Ok(())
        } else {
            Err(JwsError::BadSignature)
        }
    }

    /// Check nonce and URL, resolve the key and verify the signature
    ///
    /// # Arguments
    /// * `expected_nonce` - Required header nonce, or `None` to skip the check
    /// * `expected_url` - Required header URL, or `None` to skip the check
    /// * `lookup_kid` - Resolves a `kid` to the account's public key
    pub fn verify<F>(
        self,
        expected_nonce: Option<&str>,
        expected_url: Option<&str>,
        lookup_kid: F,
    ) -> Result<Verified, JwsError>
    where
        F: FnOnce(&str) -> Option<PKey<Public>>,
    {
        if let Some(nonce) = expected_nonce {
            if self.header.nonce.as_deref() != Some(nonce) {
                return Err(JwsError::BadNonce);
            }
        }
        if let Some(url) = expected_url {
            if self.header.url.as_deref() != Some(url) {
                return Err(JwsError::UrlMismatch);
            }
        }
        let key = match (&self.header.jwk, &self.header.kid) {
            (Some(jwk), _) => jwk.to_public_key()?,
            (None, Some(kid)) => lookup_kid(kid).ok_or(JwsError::AccountNotFound)?,
            (None, None) => return Err(JwsError::Malformed("no key in header".into())),
        };
        self.verify_signature(&key)?;
        Ok(Verified {
            payload: b64_decode("payload", &self.payload_b64)?,
            header: self.header,
            key,
        })
    }
}

/// Produce a flattened JWS as an ACME client would
///
/// `header` must not contain `alg`; it is added from the key type.
pub fn sign(key: &PKeyRef<Private>, mut header: Value, payload: &[u8]) -> Result<FlattenedJws, JwsError> {
    let err = |e: openssl::error::ErrorStack| JwsError::Malformed(e.to_string());
    let alg = match key.id() {
        Id::RSA => "RS256",
        Id::EC => "ES256",
        other => return Err(JwsError::UnsupportedKey(format!("key type {other:?}"))),
    };
    let object = header
        .as_object_mut()
        .ok_or_else(|| JwsError::Malformed("header must be a JSON object".into()))?;
    object.insert("alg".into(), Value::String(alg.into()));

    let protected = b64(header.to_string().as_bytes());
    let payload = b64(payload);
    let input = format!("{protected}.{payload}");
    let signature = match alg {
        "RS256" => {
            let mut signer = Signer::new(MessageDigest::sha256(), key).map_err(err)?;
            signer.update(input.as_bytes()).map_err(err)?;
            signer.sign_to_vec().map_err(err)?
        }
        _ => {
            let ec = key.ec_key().map_err(err)?;
            let sig = EcdsaSig::sign(&Sha256::digest(input.as_bytes()), &ec).map_err(err)?;
            let mut raw = sig.r().to_vec_padded(P256_COORDINATE_LEN as i32).map_err(err)?;
            raw.extend(sig.s().to_vec_padded(P256_COORDINATE_LEN as i32).map_err(err)?);
            raw
        }
    };
    Ok(FlattenedJws {
        protected,
        payload,
        signature: b64(&signature),
    })
}
