//! Content-derived image tags.
//!
//! Every built image is tagged with a prefix of its digest, so the tag
//! changes exactly when the content does and a reference can be checked
//! against a digest without asking the daemon.

use crate::error::{KilnError, Result};
use oci_distribution::Reference;
use std::fmt;

/// Prefix of every content-derived tag.
pub const IMAGE_TAG_PREFIX: &str = "kiln-";

/// Number of encoded digest characters kept in a tag.
const TAG_DIGEST_LEN: usize = 16;

/// Image content digest, `algorithm:encoded`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// The part after the algorithm, or the whole string if there is none.
    pub fn encoded(&self) -> &str {
        match self.0.split_once(':') {
            Some((_, encoded)) => encoded,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Digest {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Tag for an image with `digest`.
pub fn digest_as_tag(digest: &Digest) -> Result<String> {
    let encoded = digest.encoded();
    match encoded.get(..TAG_DIGEST_LEN) {
        Some(prefix) => Ok(format!("{}{}", IMAGE_TAG_PREFIX, prefix)),
        None => Err(KilnError::DigestTooShort { digest: digest.to_string() }),
    }
}

/// Returns true if `reference` carries a content tag matching `digest`.
pub fn digest_matches_ref(reference: &Reference, digest: &Digest) -> bool {
    let Some(tag) = reference.tag() else { return false };
    match tag.strip_prefix(IMAGE_TAG_PREFIX) {
        Some(short) if !short.is_empty() => digest.encoded().starts_with(short),
        _ => false,
    }
}

/// Digest from a build's aux payload, `{"ID": "sha256:..."}`.
pub fn digest_from_aux(aux: &serde_json::Value) -> Result<Digest> {
    let fields = aux.as_object().ok_or_else(|| KilnError::InvalidAux {
        reason: format!("expected an object, got {}", aux),
    })?;
    match fields.get("ID").and_then(serde_json::Value::as_str) {
        Some(id) => Ok(Digest::new(id)),
        None => Err(KilnError::InvalidAux { reason: "ID not found".to_string() }),
    }
}

/// Parse a user-supplied image reference.
pub fn parse_reference(image: &str) -> Result<Reference> {
    Reference::try_from(image).map_err(|e| KilnError::InvalidReference {
        reference: image.to_string(),
        reason: e.to_string(),
    })
}

/// `reference` retagged with the content tag for `digest`.
pub fn tagged_reference(reference: &Reference, digest: &Digest) -> Result<Reference> {
    let tag = digest_as_tag(digest)?;
    Ok(Reference::with_tag(
        reference.registry().to_string(),
        reference.repository().to_string(),
        tag,
    ))
}
