//! Identity helpers. Provider identities are opaque base64url strings of
//! the form `guid#<file id>#<space id>` (or `shareGuid#...` for shared
//! files); nothing outside this module parses them.

use crate::error::{ClientError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

fn decode_identity(uuid: &str) -> Result<String> {
    let trimmed = uuid.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|_| ClientError::InvalidArgument {
            msg: format!("identity is not valid base64url: {uuid}"),
        })?;
    String::from_utf8(bytes).map_err(|_| ClientError::InvalidArgument {
        msg: format!("identity does not decode to text: {uuid}"),
    })
}

/// Extracts the space id encoded inside an identity.
pub fn uuid_to_space_id(uuid: &str) -> Result<String> {
    let decoded = decode_identity(uuid)?;
    let parts: Vec<&str> = decoded.split('#').collect();
    if parts.len() < 3 || (parts[0] != "guid" && parts[0] != "shareGuid") {
        return Err(ClientError::InvalidArgument {
            msg: format!("invalid identity format: {decoded}"),
        });
    }
    Ok(parts[2].to_string())
}

/// Identity of a space's root directory.
pub fn space_id_to_space_uuid(space_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("guid#space_{space_id}#{space_id}"))
}

/// Builds an identity from its file and space parts. Used by providers
/// when assigning identities; the client needs it for space roots and in
/// tests.
pub fn encode_uuid(file_id: &str, space_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("guid#{file_id}#{space_id}"))
}
