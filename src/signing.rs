use crate::error::SearchError;
use crate::types::ImageSource;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha1 = Hmac<Sha1>;

/// One field of a signed multipart request.
#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    File(ImageSource),
}

/// Request fields in canonical (lexicographic key) order, signable with
/// HMAC-SHA1. File fields contribute their basename to the signature, not
/// their path. The signature itself is never inserted here; callers append
/// it to the outgoing request under `api_sig` after signing.
#[derive(Debug, Default)]
pub struct SignedForm {
    fields: BTreeMap<String, FormValue>,
}

impl SignedForm {
    pub fn new() -> Self {
        SignedForm {
            fields: BTreeMap::new(),
        }
    }

    pub fn insert_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), FormValue::Text(value.into()));
    }

    pub fn insert_file(&mut self, key: impl Into<String>, source: ImageSource) {
        self.fields.insert(key.into(), FormValue::File(source));
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FormValue)> {
        self.fields.iter()
    }

    /// Keys and values concatenated in key order with no separators.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            match value {
                FormValue::Text(v) => out.push_str(v),
                FormValue::File(src) => out.push_str(basename(&src.file_name())),
            }
        }
        out
    }

    /// Lowercase hex HMAC-SHA1 of the canonical string.
    pub fn signature(&self, secret: &str) -> Result<String, SearchError> {
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
            .map_err(|e| SearchError::Config(format!("unusable API secret: {}", e)))?;
        mac.update(self.canonical_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn basename(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
}

/// UTC timestamp in the wire format, 14 digits.
pub fn timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_form() -> SignedForm {
        let mut form = SignedForm::new();
        form.insert_text("api_key", "key123");
        form.insert_text("time_stamp", "20240101120000");
        form.insert_file("img", ImageSource::from_path("/tmp/uploads/photo.jpg"));
        form
    }

    #[test]
    fn canonical_string_sorts_keys_and_uses_basenames() {
        let form = sample_form();
        assert_eq!(
            form.canonical_string(),
            "api_keykey123imgphoto.jpgtime_stamp20240101120000"
        );
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut reversed = SignedForm::new();
        reversed.insert_file("img", ImageSource::from_path("/tmp/uploads/photo.jpg"));
        reversed.insert_text("time_stamp", "20240101120000");
        reversed.insert_text("api_key", "key123");
        assert_eq!(reversed.canonical_string(), sample_form().canonical_string());
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sample_form().signature("secret").unwrap();
        let b = sample_form().signature("secret").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn signature_changes_with_secret_or_fields() {
        let base = sample_form().signature("secret").unwrap();
        assert_ne!(base, sample_form().signature("other").unwrap());

        let mut changed = sample_form();
        changed.insert_text("device_id", "abc");
        assert_ne!(base, changed.signature("secret").unwrap());
    }

    #[test]
    fn moving_a_file_without_renaming_keeps_the_signature() {
        let base = sample_form().signature("secret").unwrap();

        let mut moved = sample_form();
        moved.insert_file("img", ImageSource::from_path("/elsewhere/photo.jpg"));
        assert_eq!(base, moved.signature("secret").unwrap());

        let mut renamed = sample_form();
        renamed.insert_file("img", ImageSource::from_path("/tmp/uploads/other.jpg"));
        assert_ne!(base, renamed.signature("secret").unwrap());
    }

    #[test]
    fn in_memory_images_sign_by_given_name() {
        let mut form = SignedForm::new();
        form.insert_file(
            "img",
            ImageSource::Bytes {
                data: vec![1, 2, 3],
                file_name: "frame.jpg".into(),
            },
        );
        assert_eq!(form.canonical_string(), "imgframe.jpg");
    }

    #[test]
    fn timestamp_is_fourteen_digits() {
        let ts = timestamp();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }
}
