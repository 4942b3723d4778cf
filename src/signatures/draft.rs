//! The legacy `draft-cavage-http-signatures-12` dialect
//!
//! Still the lingua franca of the fediverse: a single `Signature` header of
//! `name="value"` pairs, a signing string of header lines prefixed by the
//! `(request-target)` pseudo-header, and a `Digest` header over the body.

use crate::{
    error::Error,
    keys::KeyAlgorithm,
    signatures::{
        key_ring::{FetchedKey, KeyRing},
        path_and_query,
        url_authority,
        SignerIdentity,
        VerifyOptions,
    },
    timing::timing_safe_equal,
};
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use http::{header, HeaderMap, HeaderValue, Method};
use httpdate::{fmt_http_date, parse_http_date};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::{collections::HashMap, time::SystemTime};
use tracing::debug;
use url::Url;

/// Sign a request in place. Ensures `Host` and `Date` are present, adds a
/// `Digest` when a body is given, and sets the `Signature` header.
///
/// The dialect is defined over RSASSA-PKCS1-v1_5 SHA-256; other key
/// algorithms fail with [Error::UnsupportedAlgorithm].
pub fn sign_request(
    headers: &mut HeaderMap,
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    identity: &SignerIdentity,
) -> Result<(), Error> {
    if identity.private_key.algorithm() != KeyAlgorithm::RsaSha256 {
        return Err(Error::UnsupportedAlgorithm);
    }
    if !headers.contains_key(header::HOST) {
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&url_authority(url)?).map_err(Error::other)?,
        );
    }
    if !headers.contains_key(header::DATE) {
        headers.insert(
            header::DATE,
            HeaderValue::from_str(&fmt_http_date(SystemTime::now())).map_err(Error::other)?,
        );
    }
    if let Some(body) = body {
        if !headers.contains_key("digest") {
            let digest = format!("SHA-256={}", Base64.encode(Sha256::digest(body)));
            headers.insert("digest", HeaderValue::from_str(&digest).map_err(Error::other)?);
        }
    }

    let mut names = vec!["(request-target)", "host", "date"];
    if body.is_some() {
        names.push("digest");
    }
    if headers.contains_key(header::CONTENT_TYPE) {
        names.push("content-type");
    }

    let signing_string = signing_string(&names, headers, method, url)?;
    let signature = identity.private_key.sign(signing_string.as_bytes())?;
    let value = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        identity.key_id,
        names.join(" "),
        Base64.encode(signature),
    );
    headers.insert(
        "signature",
        HeaderValue::from_str(&value).map_err(Error::other)?,
    );
    Ok(())
}

/// Verify the `Signature` header of an incoming request.
///
/// Returns the signer's public key on success, `None` on any failure. A
/// verification failure against a cached key triggers one cache-bypassing
/// refetch before giving up.
pub async fn verify_request(
    headers: &HeaderMap,
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    ring: &KeyRing,
    options: &VerifyOptions,
) -> Option<FetchedKey> {
    let header = headers.get("signature")?.to_str().ok()?;
    let params = parse_signature_params(header);
    let key_id = params.get("keyid")?;
    let covered = params.get("headers")?;
    let signature = Base64.decode(params.get("signature")?).ok()?;
    if let Some(algorithm) = params.get("algorithm") {
        if algorithm != "rsa-sha256" && algorithm != "hs2019" {
            debug!("rejecting draft signature with algorithm {algorithm}");
            return None;
        }
    }

    let names: Vec<String> = covered
        .split_ascii_whitespace()
        .map(str::to_ascii_lowercase)
        .collect();
    if !names.iter().any(|n| n == "(request-target)") || !names.iter().any(|n| n == "date") {
        return None;
    }
    if body.is_some() && !names.iter().any(|n| n == "digest") {
        return None;
    }

    let date = headers.get(header::DATE)?.to_str().ok()?;
    let timestamp = parse_http_date(date).ok()?;
    if !options.in_window(timestamp) {
        debug!("draft signature date {date} outside the allowed window");
        return None;
    }

    if let Some(body) = body {
        verify_digest(headers.get("digest")?, body)?;
    }

    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let signing_string = signing_string(&name_refs, headers, method, url).ok()?;

    let key_id = Url::parse(key_id).ok()?;
    let (fetched, from_cache) = ring.get(&key_id).await?;
    if verify_with(&fetched, &signing_string, &signature) {
        return Some(fetched);
    }
    // The cached key may be stale after a key rotation; retry once, fresh.
    if from_cache {
        let fresh = ring.get_fresh(&key_id).await?;
        if verify_with(&fresh, &signing_string, &signature) {
            return Some(fresh);
        }
    }
    debug!("draft signature verification failed for {key_id}");
    None
}

fn verify_with(fetched: &FetchedKey, signing_string: &str, signature: &[u8]) -> bool {
    // RSA keys verify under SHA-256 in this dialect regardless of their tag.
    let key = fetched
        .key
        .clone()
        .with_algorithm(KeyAlgorithm::RsaSha256)
        .unwrap_or_else(|_| fetched.key.clone());
    key.verify(signing_string.as_bytes(), signature)
        .unwrap_or(false)
}

/// Build the signing string for the given covered names, in order.
fn signing_string(
    names: &[&str],
    headers: &HeaderMap,
    method: &Method,
    url: &Url,
) -> Result<String, Error> {
    let mut lines = Vec::with_capacity(names.len());
    for name in names {
        if *name == "(request-target)" {
            lines.push(format!(
                "(request-target): {} {}",
                method.as_str().to_ascii_lowercase(),
                path_and_query(url),
            ));
        } else if let Some(value) = headers.get(*name) {
            let value = value.to_str().map_err(Error::other)?;
            lines.push(format!("{}: {}", name, value.trim()));
        } else if *name == "host" {
            // Host may be stripped by proxies; fall back to the URL host.
            lines.push(format!("host: {}", url_authority(url)?));
        } else {
            return Err(Error::SignatureInvalid);
        }
    }
    Ok(lines.join("\n"))
}

/// Parse the `Signature` header into lowercased key → value pairs.
fn parse_signature_params(header: &str) -> HashMap<String, String> {
    header
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            let value = value.trim().trim_matches('"');
            Some((key.trim().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

/// Verify the `Digest` header against the body.
///
/// Every recognized algorithm present must match its value, unrecognized
/// entries are ignored, and at least one recognized algorithm is required.
fn verify_digest(header: &HeaderValue, body: &[u8]) -> Option<()> {
    let header = header.to_str().ok()?;
    let mut recognized = 0usize;
    for part in header.split(',') {
        let (algorithm, expected) = part.trim().split_once('=')?;
        let computed = match algorithm.to_ascii_lowercase().as_str() {
            "sha" => Base64.encode(Sha1::digest(body)),
            "sha-256" => Base64.encode(Sha256::digest(body)),
            "sha-512" => Base64.encode(Sha512::digest(body)),
            _ => continue,
        };
        recognized += 1;
        if !timing_safe_equal(computed.as_bytes(), expected.trim().as_bytes()) {
            return None;
        }
    }
    if recognized == 0 {
        return None;
    }
    Some(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        document_loader::{DocumentLoader, RemoteDocument},
        keys::generate_rsa_keypair,
        kv::{KvKey, MemoryKvStore},
        signatures::key_ring::KeyRing,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::{sync::Arc, time::Duration};

    /// Serves one actor document with an embedded public key.
    pub(crate) struct ActorLoader {
        pub(crate) document: Value,
    }

    #[async_trait]
    impl DocumentLoader for ActorLoader {
        async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
            Ok(RemoteDocument {
                document_url: url.clone(),
                context_url: None,
                document: self.document.clone(),
            })
        }
    }

    pub(crate) fn test_ring(public_key_pem: &str) -> KeyRing {
        let document = json!({
            "id": "https://example.com/users/alice",
            "type": "Person",
            "publicKey": {
                "id": "https://example.com/users/alice#main-key",
                "owner": "https://example.com/users/alice",
                "publicKeyPem": public_key_pem,
            }
        });
        KeyRing::new(
            Arc::new(ActorLoader { document }),
            Arc::new(MemoryKvStore::new()),
            KvKey::new(["publicKey"]).unwrap(),
        )
    }

    pub(crate) fn test_identity(private_key_pem: &str) -> SignerIdentity {
        SignerIdentity::new(
            Url::parse("https://example.com/users/alice#main-key").unwrap(),
            crate::keys::PrivateKey::import_pem(private_key_pem).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sign_verify_roundtrip() {
        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://remote.example/users/bob/inbox").unwrap();
        let body: &[u8] = br#"{"type":"Follow"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/activity+json"),
        );
        sign_request(&mut headers, &Method::POST, &url, Some(body), &identity).unwrap();

        assert!(headers.contains_key("digest"));
        assert!(headers.contains_key(header::DATE));
        assert_eq!(
            headers.get(header::HOST).unwrap().to_str().unwrap(),
            "remote.example"
        );

        let verified = verify_request(
            &headers,
            &Method::POST,
            &url,
            Some(body),
            &ring,
            &VerifyOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            verified.key_id.as_str(),
            "https://example.com/users/alice#main-key"
        );
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://remote.example/inbox").unwrap();
        let mut headers = HeaderMap::new();
        sign_request(&mut headers, &Method::POST, &url, Some(b"original".as_slice()), &identity).unwrap();

        let verified = verify_request(
            &headers,
            &Method::POST,
            &url,
            Some(b"tampered".as_slice()),
            &ring,
            &VerifyOptions::default(),
        )
        .await;
        assert!(verified.is_none());
    }

    #[tokio::test]
    async fn test_tampered_header_rejected() {
        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://remote.example/inbox").unwrap();
        let mut headers = HeaderMap::new();
        sign_request(&mut headers, &Method::POST, &url, Some(b"body".as_slice()), &identity).unwrap();

        // Re-dating the request invalidates the signature.
        headers.insert(
            header::DATE,
            HeaderValue::from_str(&fmt_http_date(
                SystemTime::now() + Duration::from_secs(120),
            ))
            .unwrap(),
        );
        // Keep the digest valid so the failure is the signature itself.
        let verified = verify_request(
            &headers,
            &Method::POST,
            &url,
            Some(b"body".as_slice()),
            &ring,
            &VerifyOptions::default(),
        )
        .await;
        assert!(verified.is_none());
    }

    #[tokio::test]
    async fn test_date_outside_window_rejected() {
        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://remote.example/inbox").unwrap();
        let mut headers = HeaderMap::new();
        sign_request(&mut headers, &Method::POST, &url, Some(b"body".as_slice()), &identity).unwrap();

        let future = VerifyOptions {
            current_time: Some(SystemTime::now() + Duration::from_secs(2 * 60 * 60)),
            time_window: Some(Duration::from_secs(60 * 60)),
        };
        assert!(
            verify_request(&headers, &Method::POST, &url, Some(b"body".as_slice()), &ring, &future)
                .await
                .is_none()
        );

        // Disabling the window accepts the same request.
        let disabled = VerifyOptions {
            current_time: Some(SystemTime::now() + Duration::from_secs(2 * 60 * 60)),
            time_window: None,
        };
        assert!(verify_request(
            &headers,
            &Method::POST,
            &url,
            Some(b"body".as_slice()),
            &ring,
            &disabled
        )
        .await
        .is_some());
    }

    #[test]
    fn test_parse_signature_params() {
        let params = parse_signature_params(
            "keyId=\"https://example.com/u/alice#main-key\", Algorithm=\"rsa-sha256\", \
             headers=\"(request-target) host date\",signature=\"YWJj\"",
        );
        assert_eq!(
            params.get("keyid").map(String::as_str),
            Some("https://example.com/u/alice#main-key")
        );
        assert_eq!(params.get("algorithm").map(String::as_str), Some("rsa-sha256"));
        assert_eq!(params.get("signature").map(String::as_str), Some("YWJj"));
    }

    #[test]
    fn test_verify_digest_rules() {
        let body = b"hello";
        let sha256 = Base64.encode(Sha256::digest(body));
        let sha512 = Base64.encode(Sha512::digest(body));

        let good = HeaderValue::from_str(&format!("SHA-256={sha256}")).unwrap();
        assert!(verify_digest(&good, body).is_some());

        // Unrecognized algorithms are ignored as long as one recognized one matches.
        let mixed =
            HeaderValue::from_str(&format!("unknown-999=xxxx,SHA-256={sha256}")).unwrap();
        assert!(verify_digest(&mixed, body).is_some());

        // A recognized algorithm with a wrong value fails even if another matches.
        let conflicting =
            HeaderValue::from_str(&format!("SHA-256={sha256},SHA-512={sha256}")).unwrap();
        assert!(verify_digest(&conflicting, body).is_none());

        let both =
            HeaderValue::from_str(&format!("SHA-256={sha256},SHA-512={sha512}")).unwrap();
        assert!(verify_digest(&both, body).is_some());

        // Only unrecognized algorithms present fails.
        let unknown = HeaderValue::from_static("unknown-999=xxxx");
        assert!(verify_digest(&unknown, body).is_none());
    }

    #[test]
    fn test_signing_string_layout() {
        let mut headers = HeaderMap::new();
        headers.insert(header::DATE, HeaderValue::from_static("Tue, 05 Mar 2024 07:49:44 GMT"));
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        let url = Url::parse("https://example.com/users/alice/inbox?page=1").unwrap();
        let s = signing_string(
            &["(request-target)", "host", "date"],
            &headers,
            &Method::POST,
            &url,
        )
        .unwrap();
        assert_eq!(
            s,
            "(request-target): post /users/alice/inbox?page=1\n\
             host: example.com\n\
             date: Tue, 05 Mar 2024 07:49:44 GMT"
        );
    }

    #[test]
    fn test_signing_string_host_fallback() {
        let headers = HeaderMap::new();
        let url = Url::parse("https://example.com:8443/inbox").unwrap();
        let s = signing_string(&["host"], &headers, &Method::GET, &url).unwrap();
        assert_eq!(s, "host: example.com:8443");
        // Other missing headers fail.
        assert!(signing_string(&["date"], &headers, &Method::GET, &url).is_err());
    }
}
