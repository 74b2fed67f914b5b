//! Extended attribute translation.
//!
//! The provider stores xattr values as JSON documents. A value arriving
//! from the kernel is encoded as, in order of preference: the JSON it
//! already is, a JSON string, or a base64 wrapper object for binary data:
//!
//! ```text
//! {"onedata_base64":"BASE64_ENCODED_ATTRIBUTE_VALUE"}
//! ```
//!
//! Decoding inverts the scheme. A fixed catalogue of synthetic attributes
//! under the `org.onedata.` prefix is served locally by the dispatcher;
//! this module owns the names.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

pub const XATTR_PREFIX: &str = "org.onedata.";
const BASE64_WRAPPER_KEY: &str = "onedata_base64";

pub const XATTR_GUID: &str = "org.onedata.guid";
pub const XATTR_FILE_ID: &str = "org.onedata.file_id";
pub const XATTR_STORAGE_FILE_ID: &str = "org.onedata.storage_file_id";
pub const XATTR_STORAGE_ID: &str = "org.onedata.storage_id";
pub const XATTR_SPACE_ID: &str = "org.onedata.space_id";
pub const XATTR_ACCESS_TYPE: &str = "org.onedata.access_type";
pub const XATTR_FILE_BLOCKS: &str = "org.onedata.file_blocks";
pub const XATTR_FILE_BLOCKS_COUNT: &str = "org.onedata.file_blocks_count";
pub const XATTR_REPLICATION_PROGRESS: &str = "org.onedata.replication_progress";

/// Synthetic names every file advertises in listxattr.
pub const COMMON_SYNTHETIC_XATTRS: [&str; 3] = [XATTR_GUID, XATTR_FILE_ID, XATTR_SPACE_ID];

/// Synthetic names advertised additionally for regular files and links.
pub const DATA_SYNTHETIC_XATTRS: [&str; 6] = [
    XATTR_STORAGE_ID,
    XATTR_STORAGE_FILE_ID,
    XATTR_ACCESS_TYPE,
    XATTR_FILE_BLOCKS,
    XATTR_FILE_BLOCKS_COUNT,
    XATTR_REPLICATION_PROGRESS,
];

pub fn is_synthetic(name: &str) -> bool {
    COMMON_SYNTHETIC_XATTRS.contains(&name) || DATA_SYNTHETIC_XATTRS.contains(&name)
}

/// Escapes control characters so the name embeds into a JSON document.
/// Empty names are rejected.
pub fn encode_xattr_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    let mut encoded = String::with_capacity(name.len());
    for c in name.chars() {
        if ('\x00'..='\x1f').contains(&c) {
            encoded.push_str(&format!("\\u{:04x}", c as u32));
        } else {
            encoded.push(c);
        }
    }
    Some(encoded)
}

/// Encodes a raw xattr value for storage on the provider.
pub fn encode_xattr_value(value: &[u8]) -> String {
    if value.is_empty() {
        return "\"\"".to_string();
    }
    if let Ok(text) = std::str::from_utf8(value) {
        if let Ok(json) = serde_json::from_str::<Value>(text) {
            return json.to_string();
        }
        // Not JSON on its own; store it as a JSON string.
        return Value::String(text.to_string()).to_string();
    }
    let wrapped = serde_json::json!({ BASE64_WRAPPER_KEY: STANDARD.encode(value) });
    wrapped.to_string()
}

/// Decodes a provider-stored value back into the raw bytes the kernel
/// sees. Unparsable documents pass through untouched.
pub fn decode_xattr_value(stored: &str) -> Vec<u8> {
    match serde_json::from_str::<Value>(stored) {
        Ok(Value::Null) => b"null".to_vec(),
        Ok(Value::Object(map)) => {
            if let Some(Value::String(encoded)) = map.get(BASE64_WRAPPER_KEY) {
                if let Ok(bytes) = STANDARD.decode(encoded) {
                    return bytes;
                }
            }
            Value::Object(map).to_string().into_bytes()
        }
        Ok(Value::String(text)) => text.into_bytes(),
        Ok(other) => other.to_string().into_bytes(),
        Err(_) => stored.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn synthetic_catalogue_is_prefixed() {
        for name in COMMON_SYNTHETIC_XATTRS.iter().chain(DATA_SYNTHETIC_XATTRS.iter()) {
            assert!(name.starts_with(XATTR_PREFIX), "{name} lacks the prefix");
            assert!(is_synthetic(name));
        }
        assert!(!is_synthetic("user.something"));
    }

    #[test]
    fn name_encoding_escapes_control_characters() {
        assert_eq!(encode_xattr_name("plain.name").unwrap(), "plain.name");
        assert_eq!(encode_xattr_name("a\x01b").unwrap(), "a\\u0001b");
        assert!(encode_xattr_name("").is_none());
    }

    #[test]
    fn json_values_are_stored_as_json() {
        assert_eq!(encode_xattr_value(b"{\"a\":1}"), "{\"a\":1}");
        assert_eq!(encode_xattr_value(b"42"), "42");
        assert_eq!(encode_xattr_value(b"true"), "true");
    }

    #[test]
    fn plain_strings_are_quoted() {
        assert_eq!(encode_xattr_value(b"hello world"), "\"hello world\"");
    }

    #[test]
    fn empty_value_is_an_empty_json_string() {
        assert_eq!(encode_xattr_value(b""), "\"\"");
        assert_eq!(decode_xattr_value("\"\""), b"");
    }

    #[test]
    fn binary_values_take_the_base64_wrapper() {
        let value = [0xff, 0xfe, 0x00, 0x01];
        let stored = encode_xattr_value(&value);
        assert!(stored.contains("onedata_base64"));
        assert_eq!(decode_xattr_value(&stored), value);
    }

    #[test]
    fn string_round_trip() {
        let stored = encode_xattr_value(b"just a note");
        assert_eq!(decode_xattr_value(&stored), b"just a note");
    }

    #[test]
    fn canonical_json_round_trip() {
        let original = b"{\"a\":1,\"b\":[true,null]}";
        let stored = encode_xattr_value(original);
        assert_eq!(decode_xattr_value(&stored), original);
    }

    #[test]
    fn null_decodes_to_its_literal() {
        assert_eq!(decode_xattr_value("null"), b"null");
    }

    #[test]
    fn unparsable_documents_pass_through() {
        assert_eq!(decode_xattr_value("not json at all"), b"not json at all");
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_round_trip(value in proptest::collection::vec(any::<u8>(), 0..256)) {
            let stored = encode_xattr_value(&value);
            let decoded = decode_xattr_value(&stored);
            // JSON-normalising encodings may rewrite the text form, but
            // strings and binary data must survive byte-for-byte.
            match std::str::from_utf8(&value) {
                Ok(text) if serde_json::from_str::<Value>(text).is_ok() => {}
                _ => prop_assert_eq!(decoded, value),
            }
        }

        #[test]
        fn printable_strings_round_trip(text in "[ -~]{0,64}") {
            prop_assume!(serde_json::from_str::<Value>(&text).is_err() || text.is_empty());
            let stored = encode_xattr_value(text.as_bytes());
            prop_assert_eq!(decode_xattr_value(&stored), text.as_bytes());
        }
    }
}
