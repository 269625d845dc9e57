//! Canned-policy URL signing and verification.

use crate::error::{SignerError, SignerResult};
use crate::key::{CdnKeyPair, PublicKey};
use base64::Engine;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer as _, Verifier};
use sha1::Sha1;
use time::OffsetDateTime;
use url::Url;

/// Canned policy document for `resource` valid until `expires`.
pub fn canned_policy(resource: &str, expires: OffsetDateTime) -> String {
    format!(
        r#"{{"Statement":[{{"Resource":"{}","Condition":{{"DateLessThan":{{"AWS:EpochTime":{}}}}}}}]}}"#,
        resource,
        expires.unix_timestamp()
    )
}

/// Base64 with the URL-safe substitutions the CDN expects.
fn url_safe_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(bytes)
        .replace('+', "-")
        .replace('=', "_")
        .replace('/', "~")
}

fn decode_url_safe_base64(s: &str) -> SignerResult<Vec<u8>> {
    let standard = s.replace('-', "+").replace('_', "=").replace('~', "/");
    base64::engine::general_purpose::STANDARD
        .decode(standard)
        .map_err(|e| SignerError::MalformedSignedUrl(format!("invalid base64: {e}")))
}

/// Signs URLs so the CDN will serve them until they expire.
pub trait UrlSigner: Send + Sync {
    /// Return `url` with `Expires`, `Signature` and `Key-Pair-Id` appended.
    fn sign_url(&self, url: &Url, expires: OffsetDateTime) -> SignerResult<Url>;

    fn key_pair_id(&self) -> &str;
}

/// RSA-SHA1 canned-policy signer.
pub struct CannedPolicySigner {
    keypair: CdnKeyPair,
}

impl CannedPolicySigner {
    pub fn new(keypair: CdnKeyPair) -> Self {
        Self { keypair }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Sign a policy document and return the URL-safe signature.
    pub fn sign_policy(&self, policy: &str) -> SignerResult<String> {
        let signing_key = SigningKey::<Sha1>::new(self.keypair.secret().clone());
        let signature = signing_key
            .try_sign(policy.as_bytes())
            .map_err(|e| SignerError::PolicySigning(e.to_string()))?;
        Ok(url_safe_base64(&signature.to_bytes()))
    }
}

impl UrlSigner for CannedPolicySigner {
    fn sign_url(&self, url: &Url, expires: OffsetDateTime) -> SignerResult<Url> {
        let policy = canned_policy(url.as_str(), expires);
        let signature = self.sign_policy(&policy)?;

        let mut signed = url.clone();
        signed
            .query_pairs_mut()
            .append_pair("Expires", &expires.unix_timestamp().to_string())
            .append_pair("Signature", &signature)
            .append_pair("Key-Pair-Id", &self.keypair.id);
        Ok(signed)
    }

    fn key_pair_id(&self) -> &str {
        &self.keypair.id
    }
}

impl std::fmt::Debug for CannedPolicySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CannedPolicySigner")
            .field("key_pair_id", &self.keypair.id)
            .finish_non_exhaustive()
    }
}

/// Verify a URL produced by [`CannedPolicySigner::sign_url`].
///
/// Returns the expiry encoded in the URL when the signature matches.
pub fn verify_signed_url(url: &Url, public_key: &PublicKey) -> SignerResult<OffsetDateTime> {
    let mut expires = None;
    let mut signature = None;
    let mut resource = url.clone();
    resource.set_query(None);

    let mut kept = Vec::new();
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "Expires" => expires = Some(value.into_owned()),
            "Signature" => signature = Some(value.into_owned()),
            "Key-Pair-Id" => {}
            _ => kept.push((name.into_owned(), value.into_owned())),
        }
    }
    if !kept.is_empty() {
        resource.query_pairs_mut().extend_pairs(kept);
    }

    let expires = expires
        .ok_or_else(|| SignerError::MalformedSignedUrl("missing Expires".to_string()))?
        .parse::<i64>()
        .map_err(|e| SignerError::MalformedSignedUrl(format!("invalid Expires: {e}")))?;
    let expires = OffsetDateTime::from_unix_timestamp(expires)
        .map_err(|e| SignerError::MalformedSignedUrl(format!("invalid Expires: {e}")))?;
    let signature = signature
        .ok_or_else(|| SignerError::MalformedSignedUrl("missing Signature".to_string()))?;

    let sig_bytes = decode_url_safe_base64(&signature)?;
    let signature = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| SignerError::MalformedSignedUrl(e.to_string()))?;

    let policy = canned_policy(resource.as_str(), expires);
    VerifyingKey::<Sha1>::new(public_key.inner().clone())
        .verify(policy.as_bytes(), &signature)
        .map_err(|_| SignerError::SignatureMismatch)?;

    Ok(expires)
}
