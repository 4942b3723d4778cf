//! The RFC 9421 HTTP Message Signatures dialect
//!
//! Signatures are carried in two structured-field dictionaries:
//! `Signature-Input` labels each signature with the component list and
//! parameters it was created over, `Signature` carries the raw bytes. Bodies
//! are covered through `Content-Digest` rather than `Digest`.

use crate::{
    error::Error,
    keys::KeyAlgorithm,
    signatures::{
        key_ring::{FetchedKey, KeyRing},
        path_and_query,
        structured::{
            format_dictionary,
            format_inner_list_standalone,
            format_item_standalone,
            parse_dictionary,
            BareItem,
            InnerList,
            Item,
            Member,
        },
        url_authority,
        SignerIdentity,
        VerifyOptions,
    },
    timing::timing_safe_equal,
};
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use http::{header, HeaderMap, HeaderValue, Method};
use httpdate::fmt_http_date;
use sha2::{Digest, Sha256, Sha512};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use url::Url;

/// The label our signer uses; verifiers accept any label.
const SIGNATURE_LABEL: &str = "sig1";

/// Sign a request in place, emitting `Signature-Input` and `Signature`.
///
/// Covered components are `@method`, `@target-uri`, `@authority` and `date`,
/// plus `content-digest` when a body is present. `created` defaults to the
/// current clock second.
pub fn sign_request(
    headers: &mut HeaderMap,
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    identity: &SignerIdentity,
    created: Option<u64>,
) -> Result<(), Error> {
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
        let digest: Vec<(String, Member)> = vec![(
            "sha-256".to_string(),
            Member::Item(Item::plain(BareItem::ByteSeq(Sha256::digest(body).to_vec()))),
        )];
        headers.insert(
            "content-digest",
            HeaderValue::from_str(&format_dictionary(&digest)).map_err(Error::other)?,
        );
    }

    let mut components = vec!["@method", "@target-uri", "@authority", "date"];
    if body.is_some() {
        components.push("content-digest");
    }
    let created = created.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    });

    let list = InnerList {
        items: components
            .iter()
            .map(|name| Item::plain(BareItem::String((*name).to_string())))
            .collect(),
        params: vec![
            ("created".to_string(), BareItem::Integer(created as i64)),
            (
                "keyid".to_string(),
                BareItem::String(identity.key_id.to_string()),
            ),
            (
                "alg".to_string(),
                BareItem::String(identity.private_key.algorithm().rfc9421_name().to_string()),
            ),
        ],
    };

    let base = signature_base(&list, headers, method, url)?;
    let signature = identity.private_key.sign(base.as_bytes())?;

    let input_dict: Vec<(String, Member)> =
        vec![(SIGNATURE_LABEL.to_string(), Member::InnerList(list))];
    headers.insert(
        "signature-input",
        HeaderValue::from_str(&format_dictionary(&input_dict)).map_err(Error::other)?,
    );
    let sig_dict: Vec<(String, Member)> = vec![(
        SIGNATURE_LABEL.to_string(),
        Member::Item(Item::plain(BareItem::ByteSeq(signature))),
    )];
    headers.insert(
        "signature",
        HeaderValue::from_str(&format_dictionary(&sig_dict)).map_err(Error::other)?,
    );
    Ok(())
}

/// Verify the RFC 9421 signatures of an incoming request.
///
/// Each labeled signature is tried in order; the first that passes the
/// timestamp window, content-digest and signature checks wins. Returns
/// `None` when none do. Malformed signature headers parse to an empty set
/// and therefore also produce `None`.
pub async fn verify_request(
    headers: &HeaderMap,
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    ring: &KeyRing,
    options: &VerifyOptions,
) -> Option<FetchedKey> {
    let input = headers.get("signature-input")?.to_str().ok()?;
    let inputs = parse_dictionary(input);
    let signatures = parse_dictionary(headers.get("signature")?.to_str().ok()?);

    if let Some(body) = body {
        verify_content_digest(headers.get("content-digest")?, body)?;
    }

    for (label, member) in &inputs {
        let Member::InnerList(list) = member else {
            continue;
        };
        let Some(signature) = signature_bytes(&signatures, label) else {
            continue;
        };
        match verify_one(list, &signature, headers, method, url, body, ring, options).await {
            Some(key) => return Some(key),
            None => continue,
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
async fn verify_one(
    list: &InnerList,
    signature: &[u8],
    headers: &HeaderMap,
    method: &Method,
    url: &Url,
    body: Option<&[u8]>,
    ring: &KeyRing,
    options: &VerifyOptions,
) -> Option<FetchedKey> {
    let created = param_integer(&list.params, "created")?;
    let timestamp = UNIX_EPOCH + Duration::from_secs(u64::try_from(created).ok()?);
    if !options.in_window(timestamp) {
        debug!("rfc9421 signature created={created} outside the allowed window");
        return None;
    }

    let covered: Vec<&str> = list
        .items
        .iter()
        .filter_map(|item| match &item.value {
            BareItem::String(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    if !covered.contains(&"@method") {
        return None;
    }
    if body.is_some() && !covered.contains(&"content-digest") {
        return None;
    }

    let key_id = param_string(&list.params, "keyid")?;
    let key_id = Url::parse(&key_id).ok()?;
    let alg = param_string(&list.params, "alg").and_then(|a| KeyAlgorithm::from_rfc9421_name(&a));

    let base = signature_base(list, headers, method, url).ok()?;

    let (fetched, from_cache) = ring.get(&key_id).await?;
    if verify_with(&fetched, alg, &base, signature) {
        return Some(fetched);
    }
    if from_cache {
        let fresh = ring.get_fresh(&key_id).await?;
        if verify_with(&fresh, alg, &base, signature) {
            return Some(fresh);
        }
    }
    None
}

fn verify_with(
    fetched: &FetchedKey,
    alg: Option<KeyAlgorithm>,
    base: &str,
    signature: &[u8],
) -> bool {
    // An explicit alg parameter overrides the key's own tag when compatible;
    // without one the algorithm is inferred from the key itself.
    let key = match alg {
        Some(alg) => match fetched.key.clone().with_algorithm(alg) {
            Ok(key) => key,
            Err(_) => return false,
        },
        None => fetched.key.clone(),
    };
    key.verify(base.as_bytes(), signature).unwrap_or(false)
}

fn signature_bytes(signatures: &[(String, Member)], label: &str) -> Option<Vec<u8>> {
    signatures.iter().find_map(|(l, member)| {
        if l != label {
            return None;
        }
        match member {
            Member::Item(Item {
                value: BareItem::ByteSeq(bytes),
                ..
            }) => Some(bytes.clone()),
            _ => None,
        }
    })
}

fn param_string(params: &[(String, BareItem)], name: &str) -> Option<String> {
    params.iter().find_map(|(key, value)| {
        if key != name {
            return None;
        }
        match value {
            BareItem::String(s) => Some(s.clone()),
            _ => None,
        }
    })
}

fn param_integer(params: &[(String, BareItem)], name: &str) -> Option<i64> {
    params.iter().find_map(|(key, value)| {
        if key != name {
            return None;
        }
        match value {
            BareItem::Integer(n) => Some(*n),
            _ => None,
        }
    })
}

/// Construct the signature base for a component list.
///
/// One line `"name": value` per component, closed by the
/// `"@signature-params"` line carrying the serialized component list.
fn signature_base(
    list: &InnerList,
    headers: &HeaderMap,
    method: &Method,
    url: &Url,
) -> Result<String, Error> {
    let mut base = String::new();
    for item in &list.items {
        let BareItem::String(name) = &item.value else {
            return Err(Error::SignatureInvalid);
        };
        let value = derive_component(name, &item.params, headers, method, url)?;
        base.push_str(&format_item_standalone(item));
        base.push_str(": ");
        base.push_str(&value);
        base.push('\n');
    }
    base.push_str("\"@signature-params\": ");
    base.push_str(&format_inner_list_standalone(list));
    Ok(base)
}

/// Resolve a single covered component to its value.
fn derive_component(
    name: &str,
    params: &[(String, BareItem)],
    headers: &HeaderMap,
    method: &Method,
    url: &Url,
) -> Result<String, Error> {
    if let Some(derived) = name.strip_prefix('@') {
        return match derived {
            "method" => Ok(method.as_str().to_ascii_uppercase()),
            "target-uri" => Ok(url.to_string()),
            "authority" => url_authority(url),
            "scheme" => Ok(url.scheme().to_string()),
            "request-target" => Ok(format!(
                "{} {}",
                method.as_str().to_ascii_lowercase(),
                path_and_query(url),
            )),
            "path" => Ok(url.path().to_string()),
            "query" => Ok(url.query().unwrap_or_default().to_string()),
            "query-param" => {
                let wanted = param_string(params, "name")
                    .ok_or(Error::UrlVerification("@query-param requires a name"))?;
                url.query_pairs()
                    .find(|(key, _)| *key == wanted)
                    .map(|(_, value)| value.into_owned())
                    .ok_or(Error::SignatureInvalid)
            }
            "status" => Err(Error::UrlVerification(
                "@status is only valid in response signatures",
            )),
            _ => Err(Error::UrlVerification("unknown derived component")),
        };
    }
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .collect();
    if values.is_empty() {
        return Err(Error::SignatureInvalid);
    }
    Ok(values.join(", "))
}

/// Verify `Content-Digest` against the body: every recognized algorithm must
/// match and at least one must be present.
fn verify_content_digest(header: &HeaderValue, body: &[u8]) -> Option<()> {
    let entries = parse_dictionary(header.to_str().ok()?);
    let mut recognized = 0usize;
    for (algorithm, member) in &entries {
        let Member::Item(Item {
            value: BareItem::ByteSeq(expected),
            ..
        }) = member
        else {
            continue;
        };
        let computed: Vec<u8> = match algorithm.as_str() {
            "sha-256" => Sha256::digest(body).to_vec(),
            "sha-512" => Sha512::digest(body).to_vec(),
            _ => continue,
        };
        recognized += 1;
        if !timing_safe_equal(&computed, expected) {
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
mod tests {
    use super::*;
    use crate::{
        keys::{generate_ed25519_keypair, generate_rsa_keypair, PrivateKey},
        signatures::draft::tests::{test_identity, test_ring},
    };

    #[tokio::test]
    async fn test_sign_verify_roundtrip_post() {
        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://remote.example/users/bob/inbox").unwrap();
        let body: &[u8] = br#"{"type":"Create"}"#;
        let mut headers = HeaderMap::new();
        sign_request(&mut headers, &Method::POST, &url, Some(body), &identity, None).unwrap();

        let digest = headers.get("content-digest").unwrap().to_str().unwrap();
        assert!(digest.starts_with("sha-256=:"), "digest: {digest}");
        assert!(digest.ends_with(':'));

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
    async fn test_minimal_get_signature_verifies() {
        // A peer may cover only @method and @target-uri, like:
        //   Signature-Input: sig1=("@method" "@target-uri");created=...;keyid="..."
        let pair = generate_rsa_keypair().unwrap();
        let private = PrivateKey::import_pem(&pair.private_key).unwrap();
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://example.com/users/alice").unwrap();
        let created = 1_703_066_400i64;
        let list = InnerList {
            items: vec![
                Item::plain(BareItem::String("@method".into())),
                Item::plain(BareItem::String("@target-uri".into())),
            ],
            params: vec![
                ("created".to_string(), BareItem::Integer(created)),
                (
                    "keyid".to_string(),
                    BareItem::String("https://example.com/users/alice#main-key".into()),
                ),
            ],
        };
        let headers_empty = HeaderMap::new();
        let base = signature_base(&list, &headers_empty, &Method::GET, &url).unwrap();
        assert_eq!(
            base,
            "\"@method\": GET\n\
             \"@target-uri\": https://example.com/users/alice\n\
             \"@signature-params\": (\"@method\" \"@target-uri\");created=1703066400;keyid=\"https://example.com/users/alice#main-key\""
        );
        let signature = private.sign(base.as_bytes()).unwrap();

        let mut headers = HeaderMap::new();
        let input: Vec<(String, Member)> =
            vec![("sig1".to_string(), Member::InnerList(list))];
        headers.insert(
            "signature-input",
            HeaderValue::from_str(&format_dictionary(&input)).unwrap(),
        );
        let sig: Vec<(String, Member)> = vec![(
            "sig1".to_string(),
            Member::Item(Item::plain(BareItem::ByteSeq(signature))),
        )];
        headers.insert(
            "signature",
            HeaderValue::from_str(&format_dictionary(&sig)).unwrap(),
        );

        let options = VerifyOptions {
            current_time: Some(UNIX_EPOCH + Duration::from_secs(created as u64 + 600)),
            time_window: Some(Duration::from_secs(3600)),
        };
        let verified = verify_request(&headers, &Method::GET, &url, None, &ring, &options)
            .await
            .unwrap();
        assert!(verified.owner.is_some());
    }

    #[tokio::test]
    async fn test_ed25519_alg_inferred_from_key() {
        let pair = generate_ed25519_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://remote.example/inbox").unwrap();
        let mut headers = HeaderMap::new();
        sign_request(&mut headers, &Method::POST, &url, Some(b"{}".as_slice()), &identity, None).unwrap();

        // Strip the alg parameter; verification must infer ed25519 from the key.
        let input = headers.get("signature-input").unwrap().to_str().unwrap();
        let dict = parse_dictionary(input);
        let Member::InnerList(mut list) = dict[0].1.clone() else {
            panic!("expected inner list");
        };
        list.params.retain(|(k, _)| k != "alg");
        let dict: Vec<(String, Member)> =
            vec![("sig1".to_string(), Member::InnerList(list.clone()))];
        headers.insert(
            "signature-input",
            HeaderValue::from_str(&format_dictionary(&dict)).unwrap(),
        );

        // Without alg the signature base changes, so re-sign over the new base.
        let private = PrivateKey::import_pem(&pair.private_key).unwrap();
        let base = signature_base(&list, &headers, &Method::POST, &url).unwrap();
        let signature = private.sign(base.as_bytes()).unwrap();
        let sig: Vec<(String, Member)> = vec![(
            "sig1".to_string(),
            Member::Item(Item::plain(BareItem::ByteSeq(signature))),
        )];
        headers.insert(
            "signature",
            HeaderValue::from_str(&format_dictionary(&sig)).unwrap(),
        );

        let verified = verify_request(
            &headers,
            &Method::POST,
            &url,
            Some(b"{}".as_slice()),
            &ring,
            &VerifyOptions::default(),
        )
        .await;
        assert!(verified.is_some());
    }

    #[tokio::test]
    async fn test_first_valid_label_wins() {
        let pair = generate_rsa_keypair().unwrap();
        let identity = test_identity(&pair.private_key);
        let ring = test_ring(&pair.public_key);

        let url = Url::parse("https://remote.example/inbox").unwrap();
        let body: &[u8] = b"{}";
        let mut headers = HeaderMap::new();
        sign_request(&mut headers, &Method::POST, &url, Some(body), &identity, None).unwrap();

        // Prepend a garbage signature under another label.
        let input = headers.get("signature-input").unwrap().to_str().unwrap();
        let good_input = parse_dictionary(input);
        let Member::InnerList(good_list) = good_input[0].1.clone() else {
            panic!("expected inner list");
        };
        let sigs = parse_dictionary(headers.get("signature").unwrap().to_str().unwrap());
        let good_sig = sigs[0].1.clone();

        let input: Vec<(String, Member)> = vec![
            ("bad".to_string(), Member::InnerList(good_list.clone())),
            ("sig1".to_string(), Member::InnerList(good_list)),
        ];
        let sig: Vec<(String, Member)> = vec![
            (
                "bad".to_string(),
                Member::Item(Item::plain(BareItem::ByteSeq(vec![0u8; 256]))),
            ),
            ("sig1".to_string(), good_sig),
        ];
        headers.insert(
            "signature-input",
            HeaderValue::from_str(&format_dictionary(&input)).unwrap(),
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&format_dictionary(&sig)).unwrap(),
        );

        let verified = verify_request(
            &headers,
            &Method::POST,
            &url,
            Some(body),
            &ring,
            &VerifyOptions::default(),
        )
        .await;
        assert!(verified.is_some());
    }

    #[tokio::test]
    async fn test_malformed_headers_fail_closed() {
        let pair = generate_rsa_keypair().unwrap();
        let ring = test_ring(&pair.public_key);
        let url = Url::parse("https://remote.example/inbox").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "signature-input",
            HeaderValue::from_static("sig1=(\"@method\""),
        );
        headers.insert("signature", HeaderValue::from_static("sig1=:AAAA:"));
        let verified =
            verify_request(&headers, &Method::GET, &url, None, &ring, &VerifyOptions::default())
                .await;
        assert!(verified.is_none());
    }

    #[test]
    fn test_derived_components() {
        let headers = HeaderMap::new();
        let url = Url::parse("https://example.com:8443/users/alice?page=2&q=x").unwrap();
        let derive = |name: &str| derive_component(name, &[], &headers, &Method::POST, &url);
        assert_eq!(derive("@method").unwrap(), "POST");
        assert_eq!(
            derive("@target-uri").unwrap(),
            "https://example.com:8443/users/alice?page=2&q=x"
        );
        assert_eq!(derive("@authority").unwrap(), "example.com:8443");
        assert_eq!(derive("@scheme").unwrap(), "https");
        assert_eq!(
            derive("@request-target").unwrap(),
            "post /users/alice?page=2&q=x"
        );
        assert_eq!(derive("@path").unwrap(), "/users/alice");
        assert_eq!(derive("@query").unwrap(), "page=2&q=x");
        assert!(derive("@status").is_err());
        assert!(derive("@made-up").is_err());
        assert!(derive("@query-param").is_err());

        let params = vec![("name".to_string(), BareItem::String("page".into()))];
        assert_eq!(
            derive_component("@query-param", &params, &headers, &Method::POST, &url).unwrap(),
            "2"
        );
    }

    #[test]
    fn test_content_digest_rules() {
        let body = b"hello";
        let sha256 = Base64.encode(Sha256::digest(body));
        let good = HeaderValue::from_str(&format!("sha-256=:{sha256}:")).unwrap();
        assert!(verify_content_digest(&good, body).is_some());

        let wrong = HeaderValue::from_str(&format!("sha-256=:{}:", Base64.encode([0u8; 32])))
            .unwrap();
        assert!(verify_content_digest(&wrong, body).is_none());

        // Unknown algorithms alone are not enough.
        let unknown = HeaderValue::from_static("blake2=:AAAA:");
        assert!(verify_content_digest(&unknown, body).is_none());
    }
}
