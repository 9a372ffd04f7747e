use byteorder::{ByteOrder, LE};
use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::transport::ControlRequest;

/// Number of bytes the identification request asks the wheel for.
pub const IDENTIFY_RESPONSE_LEN: usize = 16;

/// Vendor request that makes the wheel report its model record.
pub const IDENTIFY_REQUEST: ControlRequest = ControlRequest {
    request_type: 0xc1,
    request: 73,
    value: 0,
    index: 0,
    length: IDENTIFY_RESPONSE_LEN as u16,
};

/// Template for the vendor request that commits the wheel to full-featured
/// mode; the value field carries the switch code and there is no data stage.
pub const SWITCH_REQUEST: ControlRequest = ControlRequest {
    request_type: 0x41,
    request: 83,
    value: 0,
    index: 0,
    length: 0,
};

/// Packets that settle the wheel before it is asked for its identity.
/// Querying a T300RS without these can crash it. Sent in order over the
/// second endpoint of the active alternate setting; an error in one aborts
/// the rest.
pub const STABILIZE_PACKETS: [&[u8]; 5] = [
    &[0x42, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x0a, 0x04, 0x90, 0x03, 0x00, 0x00, 0x00, 0x00],
    &[0x0a, 0x04, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x00],
    &[0x0a, 0x04, 0x12, 0x10, 0x00, 0x00, 0x00, 0x00],
    &[0x0a, 0x04, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00],
];

/// Leading tag of an identity record, selecting its layout. Transmitted
/// little-endian like every multi-byte field in the record.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum RecordTag {
    /// 15-byte record; attachment and model at payload offsets 4 and 5.
    Extended = 0x0049,
    /// 7-byte record; attachment and model at payload offsets 2 and 3.
    Compact = 0x0047,
}

/// Normalized output of the identity decoder. Everything else in the record
/// is unmodeled; no field has a confirmed meaning beyond these two.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WheelIdentity {
    pub model: u8,
    pub attachment: u8,
}

/// Failure modes of identity decoding.
#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("unknown identity record tag {0:#06x}, unable to proceed further")]
    UnknownTag(u16),

    #[error("identity record was {actual} bytes, expected at least {expected}")]
    TooShort { expected: usize, actual: usize },
}

/// Decode the identity record the wheel replied with. `record` must be
/// exactly the bytes received, so short replies fail the length check rather
/// than read stale buffer contents.
pub fn decode_identity(record: &[u8]) -> Result<WheelIdentity, DecodeError> {
    if record.len() < 2 {
        return Err(DecodeError::TooShort {
            expected: 2,
            actual: record.len(),
        });
    }

    let tag = LE::read_u16(&record[..2]);
    let tag = RecordTag::try_from(tag).map_err(|e| DecodeError::UnknownTag(e.number))?;

    let (attachment_at, model_at) = match tag {
        RecordTag::Extended => (6, 7),
        RecordTag::Compact => (4, 5),
    };

    if record.len() <= model_at {
        return Err(DecodeError::TooShort {
            expected: model_at + 1,
            actual: record.len(),
        });
    }

    Ok(WheelIdentity {
        model: record[model_at],
        attachment: record[attachment_at],
    })
}
