//! MFT record validation and attribute walking.
//!
//! `validate_record` is the cheap gate applied to every signature hit before
//! any expensive parsing, to suppress false positives from the full-image
//! scan. `parse_record` walks the attribute chain and extracts the candidate
//! name ($FILE_NAME) and content ($DATA, resident or via run list).

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use log::warn;

use crate::data_runs::{decode_run_list, DataRun};

pub const RECORD_SIGNATURE: &[u8; 4] = b"FILE";

/// Smallest legal record-header size; the first attribute cannot start
/// before it.
const MIN_ATTR_OFFSET: u16 = 0x2A;

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_END: u32 = 0xFFFF_FFFF;

const FLAG_IN_USE: u16 = 0x01;
const FLAG_DIRECTORY: u16 = 0x02;

/// Content of the record's $DATA attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum DataAttribute {
    /// Payload stored inline in the record.
    Resident(Vec<u8>),
    /// Payload addressed by a run list; `truncated` is set when the run
    /// list decoded only partially.
    NonResident { runs: Vec<DataRun>, truncated: bool },
}

/// What the attribute walk recovered from one record.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub source_offset: u64,
    pub is_in_use: bool,
    pub is_directory: bool,
    pub file_name: Option<String>,
    pub data: Option<DataAttribute>,
}

/// Cheap structural check: `"FILE"` signature, flags no higher than 3, and
/// a first-attribute offset inside `[0x2A, record_size)`.
pub fn validate_record(record: &[u8]) -> bool {
    if record.len() < MIN_ATTR_OFFSET as usize || &record[0..4] != RECORD_SIGNATURE {
        return false;
    }
    let flags = u16::from_le_bytes([record[0x16], record[0x17]]);
    if flags > 3 {
        return false;
    }
    let attr_offset = u16::from_le_bytes([record[0x14], record[0x15]]);
    attr_offset >= MIN_ATTR_OFFSET && (attr_offset as usize) < record.len()
}

/// Walk the attribute chain of a validated record. An attribute whose
/// declared length would overrun the record aborts the walk for this record
/// only; results gathered before the fault are kept.
pub fn parse_record(record: &[u8], source_offset: u64) -> ParsedRecord {
    let flags = u16::from_le_bytes([record[0x16], record[0x17]]);
    let mut parsed = ParsedRecord {
        source_offset,
        is_in_use: flags & FLAG_IN_USE != 0,
        is_directory: flags & FLAG_DIRECTORY != 0,
        file_name: None,
        data: None,
    };

    let mut offset = u16::from_le_bytes([record[0x14], record[0x15]]) as usize;
    while offset + 8 <= record.len() {
        let mut cursor = Cursor::new(&record[offset..]);
        let attr_type = match cursor.read_u32::<LittleEndian>() {
            Ok(t) => t,
            Err(_) => break,
        };
        if attr_type == ATTR_END || attr_type == 0 {
            break;
        }
        let attr_len = cursor.read_u32::<LittleEndian>().unwrap_or(0) as usize;
        if attr_len == 0 || offset + attr_len > record.len() {
            warn!(
                "record at 0x{source_offset:X}: attribute length {attr_len} overruns record, \
                 keeping earlier attributes"
            );
            break;
        }
        let attr = &record[offset..offset + attr_len];

        match attr_type {
            ATTR_FILE_NAME => {
                if let Some(payload) = resident_payload(attr) {
                    if let Some(name) = decode_file_name(payload) {
                        parsed.file_name = Some(name);
                    }
                }
            }
            ATTR_DATA if parsed.data.is_none() => {
                parsed.data = parse_data_attribute(attr, source_offset);
            }
            _ => {}
        }

        offset += attr_len;
    }

    parsed
}

/// Payload slice of a resident attribute, clipped to the attribute bounds.
fn resident_payload(attr: &[u8]) -> Option<&[u8]> {
    if attr.len() < 0x18 || attr[8] != 0 {
        return None;
    }
    let content_len = u32::from_le_bytes([attr[0x10], attr[0x11], attr[0x12], attr[0x13]]) as usize;
    let content_off = u16::from_le_bytes([attr[0x14], attr[0x15]]) as usize;
    if content_off >= attr.len() {
        return None;
    }
    let end = (content_off + content_len).min(attr.len());
    Some(&attr[content_off..end])
}

fn parse_data_attribute(attr: &[u8], source_offset: u64) -> Option<DataAttribute> {
    if attr.len() < 9 {
        return None;
    }
    if attr[8] == 0 {
        return resident_payload(attr).map(|p| DataAttribute::Resident(p.to_vec()));
    }
    if attr.len() < 0x22 {
        return None;
    }
    let runs_off = u16::from_le_bytes([attr[0x20], attr[0x21]]) as usize;
    if runs_off >= attr.len() {
        return None;
    }
    match decode_run_list(&attr[runs_off..]) {
        Ok(runs) => Some(DataAttribute::NonResident {
            runs,
            truncated: false,
        }),
        Err(err) => {
            // Structurally inconsistent but partially decodable: keep what
            // decoded successfully and let reconstruction try it.
            warn!("record at 0x{source_offset:X}: {err}");
            Some(DataAttribute::NonResident {
                runs: err.decoded,
                truncated: true,
            })
        }
    }
}

/// UTF-16LE name from a $FILE_NAME payload: length prefix at 0x40, the name
/// itself from 0x42. A name that would overrun the payload is clipped.
fn decode_file_name(payload: &[u8]) -> Option<String> {
    if payload.len() < 0x42 {
        return None;
    }
    let declared = payload[0x40] as usize;
    let start = 0x42;
    let end = (start + declared * 2).min(payload.len());
    let units: Vec<u16> = payload[start..end]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    if units.is_empty() {
        return None;
    }
    Some(String::from_utf16_lossy(&units))
}
