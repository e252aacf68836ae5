//! Record envelope encoding.
//!
//! Tag assignments are permanent:
//!
//! | tag | field                  | payload            |
//! |-----|------------------------|--------------------|
//! | 1   | created_at_unix        | zigzag varint      |
//! | 2   | public                 | 1 byte (0/1)       |
//! | 3   | satellite_address      | utf-8              |
//! | 4   | macaroon_head          | bytes              |
//! | 5   | encrypted_secret_key   | bytes              |
//! | 6   | encrypted_access_grant | bytes              |
//! | 7   | expires_at_unix        | zigzag varint      |
//! | 8   | invalidated_at_unix    | zigzag varint      |
//! | 9   | invalidation_reason    | utf-8              |
//! | 10  | state                  | 1 byte             |
//! | 11  | tombstoned_at_unix     | zigzag varint      |
//! | 12  | put_clock              | unsigned varint    |
//! | 13  | put_node_id            | 16 bytes           |
//! | 14  | state_clock            | unsigned varint    |
//! | 15  | state_node_id          | 16 bytes           |
//!
//! Fields holding their default value are omitted, so two equal records
//! always encode to identical bytes.

use sett_types::{NodeId, Record, RecordState};

use crate::error::CodecError;
use crate::wire::{
    FieldReader, field_array, field_ivarint, field_string, field_uvarint, put_field,
    put_ivarint_field, put_uvarint_field,
};

const TAG_CREATED_AT: u64 = 1;
const TAG_PUBLIC: u64 = 2;
const TAG_SATELLITE_ADDRESS: u64 = 3;
const TAG_MACAROON_HEAD: u64 = 4;
const TAG_ENCRYPTED_SECRET_KEY: u64 = 5;
const TAG_ENCRYPTED_ACCESS_GRANT: u64 = 6;
const TAG_EXPIRES_AT: u64 = 7;
const TAG_INVALIDATED_AT: u64 = 8;
const TAG_INVALIDATION_REASON: u64 = 9;
const TAG_STATE: u64 = 10;
const TAG_TOMBSTONED_AT: u64 = 11;
const TAG_PUT_CLOCK: u64 = 12;
const TAG_PUT_NODE_ID: u64 = 13;
const TAG_STATE_CLOCK: u64 = 14;
const TAG_STATE_NODE_ID: u64 = 15;

/// Encode a record into its canonical envelope.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        64 + record.satellite_address.len()
            + record.macaroon_head.len()
            + record.encrypted_secret_key.len()
            + record.encrypted_access_grant.len(),
    );

    if record.created_at_unix != 0 {
        put_ivarint_field(&mut buf, TAG_CREATED_AT, record.created_at_unix);
    }
    if record.public {
        put_field(&mut buf, TAG_PUBLIC, &[1]);
    }
    if !record.satellite_address.is_empty() {
        put_field(&mut buf, TAG_SATELLITE_ADDRESS, record.satellite_address.as_bytes());
    }
    if !record.macaroon_head.is_empty() {
        put_field(&mut buf, TAG_MACAROON_HEAD, &record.macaroon_head);
    }
    if !record.encrypted_secret_key.is_empty() {
        put_field(&mut buf, TAG_ENCRYPTED_SECRET_KEY, &record.encrypted_secret_key);
    }
    if !record.encrypted_access_grant.is_empty() {
        put_field(&mut buf, TAG_ENCRYPTED_ACCESS_GRANT, &record.encrypted_access_grant);
    }
    if record.expires_at_unix != 0 {
        put_ivarint_field(&mut buf, TAG_EXPIRES_AT, record.expires_at_unix);
    }
    if record.invalidated_at_unix != 0 {
        put_ivarint_field(&mut buf, TAG_INVALIDATED_AT, record.invalidated_at_unix);
    }
    if !record.invalidation_reason.is_empty() {
        put_field(&mut buf, TAG_INVALIDATION_REASON, record.invalidation_reason.as_bytes());
    }
    if record.state != RecordState::Live {
        put_field(&mut buf, TAG_STATE, &[record.state.code()]);
    }
    if record.tombstoned_at_unix != 0 {
        put_ivarint_field(&mut buf, TAG_TOMBSTONED_AT, record.tombstoned_at_unix);
    }
    if record.put_clock != 0 {
        put_uvarint_field(&mut buf, TAG_PUT_CLOCK, record.put_clock);
    }
    if record.put_node_id != NodeId::ZERO {
        put_field(&mut buf, TAG_PUT_NODE_ID, record.put_node_id.as_bytes());
    }
    if record.state_clock != 0 {
        put_uvarint_field(&mut buf, TAG_STATE_CLOCK, record.state_clock);
    }
    if record.state_node_id != NodeId::ZERO {
        put_field(&mut buf, TAG_STATE_NODE_ID, record.state_node_id.as_bytes());
    }

    buf
}

/// Decode a record envelope. Unknown tags are skipped.
pub fn decode_record(bytes: &[u8]) -> Result<Record, CodecError> {
    let mut record = Record {
        created_at_unix: 0,
        public: false,
        satellite_address: String::new(),
        macaroon_head: Vec::new(),
        encrypted_secret_key: Vec::new(),
        encrypted_access_grant: Vec::new(),
        expires_at_unix: 0,
        invalidated_at_unix: 0,
        invalidation_reason: String::new(),
        tombstoned_at_unix: 0,
        state: RecordState::Live,
        put_clock: 0,
        put_node_id: NodeId::ZERO,
        state_clock: 0,
        state_node_id: NodeId::ZERO,
    };

    for field in FieldReader::new(bytes) {
        let (tag, payload) = field?;
        match tag {
            TAG_CREATED_AT => record.created_at_unix = field_ivarint(payload)?,
            TAG_PUBLIC => record.public = payload.first().is_some_and(|b| *b != 0),
            TAG_SATELLITE_ADDRESS => {
                record.satellite_address = field_string(payload, "satellite_address")?;
            }
            TAG_MACAROON_HEAD => record.macaroon_head = payload.to_vec(),
            TAG_ENCRYPTED_SECRET_KEY => record.encrypted_secret_key = payload.to_vec(),
            TAG_ENCRYPTED_ACCESS_GRANT => record.encrypted_access_grant = payload.to_vec(),
            TAG_EXPIRES_AT => record.expires_at_unix = field_ivarint(payload)?,
            TAG_INVALIDATED_AT => record.invalidated_at_unix = field_ivarint(payload)?,
            TAG_INVALIDATION_REASON => {
                record.invalidation_reason = field_string(payload, "invalidation_reason")?;
            }
            TAG_STATE => {
                let code = *payload.first().ok_or(CodecError::BadFieldLength {
                    field: "state",
                    len: 0,
                })?;
                record.state = RecordState::from_code(code).ok_or(CodecError::InvalidCode {
                    what: "record state",
                    code,
                })?;
            }
            TAG_TOMBSTONED_AT => record.tombstoned_at_unix = field_ivarint(payload)?,
            TAG_PUT_CLOCK => record.put_clock = field_uvarint(payload)?,
            TAG_PUT_NODE_ID => {
                record.put_node_id = NodeId::from(field_array::<16>(payload, "put_node_id")?);
            }
            TAG_STATE_CLOCK => record.state_clock = field_uvarint(payload)?,
            TAG_STATE_NODE_ID => {
                record.state_node_id = NodeId::from(field_array::<16>(payload, "state_node_id")?);
            }
            _ => {} // unknown tag from a newer schema — skip
        }
    }

    Ok(record)
}
