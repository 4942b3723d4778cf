//! Creating and verifying HTTP message signatures under both wire dialects
//!
//! Two incompatible specifications are in live use across the fediverse: the
//! legacy draft (`draft-cavage-http-signatures-12`, the `Signature` header)
//! and the finalized RFC 9421 (`Signature-Input` + `Signature` headers).
//! [draft] and [rfc9421] implement one signer/verifier pair each;
//! [double_knock] negotiates between them per peer and remembers the result.

pub mod double_knock;
pub mod draft;
pub mod key_ring;
pub mod rfc9421;
pub mod structured;

use crate::{
    error::Error,
    keys::{KeyUse, PrivateKey},
};
use http::{HeaderMap, Method};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
    time::{Duration, SystemTime},
};
use url::Url;

/// Which HTTP message signature dialect a request is signed under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureSpec {
    /// RFC 9421 HTTP Message Signatures
    Rfc9421,
    /// draft-cavage-http-signatures-12
    DraftCavage,
}

impl SignatureSpec {
    /// The opposite dialect, tried on the second knock.
    pub fn other(self) -> SignatureSpec {
        match self {
            SignatureSpec::Rfc9421 => SignatureSpec::DraftCavage,
            SignatureSpec::DraftCavage => SignatureSpec::Rfc9421,
        }
    }
}

impl Display for SignatureSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SignatureSpec::Rfc9421 => "rfc9421",
            SignatureSpec::DraftCavage => "draft-cavage-http-signatures-12",
        })
    }
}

impl FromStr for SignatureSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rfc9421" => Ok(SignatureSpec::Rfc9421),
            "draft-cavage-http-signatures-12" => Ok(SignatureSpec::DraftCavage),
            _ => Err(Error::UnsupportedAlgorithm),
        }
    }
}

/// A key identifier URL plus the private key it names: everything needed to
/// sign outgoing requests on behalf of a local actor.
#[derive(Clone, Debug)]
pub struct SignerIdentity {
    /// URL under which peers can fetch the public half
    pub key_id: Url,
    /// The private key
    pub private_key: PrivateKey,
}

impl SignerIdentity {
    /// Create an identity, validating the key for signing use.
    pub fn new(key_id: Url, private_key: PrivateKey) -> Result<SignerIdentity, Error> {
        private_key.validate(KeyUse::Sign)?;
        Ok(SignerIdentity {
            key_id,
            private_key,
        })
    }
}

/// Options for signature verification.
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// The clock to verify timestamps against; defaults to the system clock.
    pub current_time: Option<SystemTime>,
    /// Maximum allowed skew between the request timestamp and the clock.
    /// `None` disables the timestamp check.
    pub time_window: Option<Duration>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            current_time: None,
            time_window: Some(Duration::from_secs(60 * 60)),
        }
    }
}

impl VerifyOptions {
    pub(crate) fn now(&self) -> SystemTime {
        self.current_time.unwrap_or_else(SystemTime::now)
    }

    /// Whether `timestamp` lies within the allowed window of the clock.
    pub(crate) fn in_window(&self, timestamp: SystemTime) -> bool {
        let Some(window) = self.time_window else {
            return true;
        };
        let now = self.now();
        let skew = now
            .duration_since(timestamp)
            .or_else(|_| timestamp.duration_since(now))
            .unwrap_or(Duration::ZERO);
        skew <= window
    }
}

/// Sign an outgoing request under `spec`, mutating `headers` in place.
///
/// The body is passed as a byte slice so the same buffer can be re-signed
/// across redirects and double-knock retries without stream exhaustion.
pub fn sign_request(
    spec: SignatureSpec,
    headers: &mut HeaderMap,
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    identity: &SignerIdentity,
) -> Result<(), Error> {
    match spec {
        SignatureSpec::DraftCavage => draft::sign_request(headers, method, url, body, identity),
        SignatureSpec::Rfc9421 => rfc9421::sign_request(headers, method, url, body, identity, None),
    }
}

/// Derive the `host[:port]` authority string of a URL.
pub(crate) fn url_authority(url: &Url) -> Result<String, Error> {
    let host = url
        .host_str()
        .ok_or(Error::UrlVerification("url has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// The path plus optional query of a URL, as used in request targets.
pub(crate) fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}
