//! CDMI object-id translation for the `file_id` synthetic attribute and
//! the file-id access prefix.
//!
//! An object id is the hex rendering of a 8-byte header followed by the
//! opaque identity bytes:
//!
//! ```text
//! +----------+------------+-----------+--------+-------+--------+
//! |     0    | 1 | 2 | 3  |     4     |   5    | 6 | 7 | 8 ...  |
//! | reserved | enterprise | reserved  | length |  CRC  | opaque |
//! +----------+------------+-----------+--------+-------+--------+
//! ```
//!
//! The CRC field holds CRC-16/ARC of the whole id computed with the CRC
//! bytes zeroed.

use crate::error::{ClientError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

const OBJECT_ID_DATA_OFFSET: usize = 8;
const MAX_OPAQUE_DATA: usize = 255;

/// CRC-16/ARC: poly 0x8005 reflected, init 0, no final xor.
fn crc16_arc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Renders a provider identity as a CDMI object id.
pub fn uuid_to_object_id(uuid: &str) -> Result<String> {
    let opaque = URL_SAFE_NO_PAD
        .decode(uuid.trim_end_matches('='))
        .map_err(|_| ClientError::InvalidArgument {
            msg: format!("identity is not valid base64url: {uuid}"),
        })?;
    if opaque.len() > MAX_OPAQUE_DATA {
        return Err(ClientError::InvalidArgument {
            msg: format!("identity too long for a CDMI object id: {} bytes", opaque.len()),
        });
    }

    let enterprise_number: u32 = 0;
    let mut object_id = Vec::with_capacity(OBJECT_ID_DATA_OFFSET + opaque.len());
    object_id.push(0);
    object_id.push(((enterprise_number >> 16) & 0xFF) as u8);
    object_id.push(((enterprise_number >> 8) & 0xFF) as u8);
    object_id.push((enterprise_number & 0xFF) as u8);
    object_id.push(0);
    object_id.push(opaque.len() as u8);
    object_id.push(0);
    object_id.push(0);
    object_id.extend_from_slice(&opaque);

    let crc = crc16_arc(&object_id);
    object_id[6] = (crc >> 8) as u8;
    object_id[7] = (crc & 0xFF) as u8;

    Ok(hex::encode_upper(object_id))
}

/// Decodes a CDMI object id back into a provider identity.
pub fn object_id_to_uuid(object_id: &str) -> Result<String> {
    let bytes = hex::decode(object_id).map_err(|_| ClientError::InvalidArgument {
        msg: format!("object id is not valid hex: {object_id}"),
    })?;
    if bytes.len() <= OBJECT_ID_DATA_OFFSET {
        return Err(ClientError::InvalidArgument {
            msg: format!("object id too short: {} bytes", bytes.len()),
        });
    }
    Ok(URL_SAFE_NO_PAD.encode(&bytes[OBJECT_ID_DATA_OFFSET..]))
}
