// Minimal ISO-BMFF box parsing: `sidx` for SegmentBase indexes and `emsg`
// for inband events. Only top-level boxes are scanned; the core never
// inspects media payloads.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read};

use crate::error::DashError;

/// One subsegment described by a `sidx` box, with absolute byte offsets
/// into the containing resource and times in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct SidxEntry {
    pub start_byte: u64,
    /// Inclusive end offset.
    pub end_byte: u64,
    pub start_time: f64,
    pub end_time: f64,
}

/// An inband `emsg` event message box (version 0 or 1).
#[derive(Debug, Clone)]
pub struct EmsgBox {
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    /// Version 0: delta from the segment start, in timescale units.
    pub presentation_time_delta: Option<u32>,
    /// Version 1: absolute presentation time, in timescale units.
    pub presentation_time: Option<u64>,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Bytes,
}

struct BoxHeader {
    box_type: [u8; 4],
    /// Offset of the payload within the scanned buffer.
    payload_start: usize,
    /// Offset one past the box end within the scanned buffer.
    box_end: usize,
}

/// Reads the box header at `offset`; `None` when the data is exhausted or
/// too truncated to describe a box.
fn read_box_header(data: &[u8], offset: usize) -> Option<BoxHeader> {
    if offset + 8 > data.len() {
        return None;
    }
    let size32 = u32::from_be_bytes(data[offset..offset + 4].try_into().ok()?) as u64;
    let box_type: [u8; 4] = data[offset + 4..offset + 8].try_into().ok()?;
    let (payload_start, size) = if size32 == 1 {
        if offset + 16 > data.len() {
            return None;
        }
        let large = u64::from_be_bytes(data[offset + 8..offset + 16].try_into().ok()?);
        (offset + 16, large)
    } else if size32 == 0 {
        (offset + 8, (data.len() - offset) as u64)
    } else {
        (offset + 8, size32)
    };
    let box_end = offset.checked_add(usize::try_from(size).ok()?)?;
    if box_end > data.len() || payload_start > box_end {
        return None;
    }
    Some(BoxHeader {
        box_type,
        payload_start,
        box_end,
    })
}

/// Parses a `sidx` box out of `data`, which was fetched from
/// `data_resource_offset` within its resource (the start of the index
/// range). Returns subsegment references with absolute byte ranges.
pub fn parse_sidx(data: &[u8], data_resource_offset: u64) -> Result<Vec<SidxEntry>, DashError> {
    let malformed = |reason: &str| DashError::MalformedBox {
        box_type: "sidx",
        reason: reason.to_string(),
    };

    let mut offset = 0;
    let header = loop {
        let header = read_box_header(data, offset).ok_or_else(|| malformed("no sidx box found"))?;
        if &header.box_type == b"sidx" {
            break header;
        }
        offset = header.box_end;
    };

    let mut cursor = Cursor::new(&data[header.payload_start..header.box_end]);
    let version = cursor.read_u8().map_err(|_| malformed("truncated"))?;
    let mut flags = [0u8; 3];
    cursor.read_exact(&mut flags).map_err(|_| malformed("truncated"))?;
    let _reference_id = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| malformed("truncated"))?;
    let timescale = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| malformed("truncated"))?;
    if timescale == 0 {
        return Err(malformed("zero timescale"));
    }
    let (earliest_presentation_time, first_offset) = if version == 0 {
        (
            cursor
                .read_u32::<BigEndian>()
                .map_err(|_| malformed("truncated"))? as u64,
            cursor
                .read_u32::<BigEndian>()
                .map_err(|_| malformed("truncated"))? as u64,
        )
    } else {
        (
            cursor
                .read_u64::<BigEndian>()
                .map_err(|_| malformed("truncated"))?,
            cursor
                .read_u64::<BigEndian>()
                .map_err(|_| malformed("truncated"))?,
        )
    };
    let _reserved = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| malformed("truncated"))?;
    let reference_count = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| malformed("truncated"))?;

    // Subsegment offsets are relative to the first byte after the sidx box.
    let anchor = data_resource_offset + header.box_end as u64;
    let mut next_start_byte = anchor + first_offset;
    let mut time_units = earliest_presentation_time;
    let mut entries = Vec::with_capacity(reference_count as usize);
    for _ in 0..reference_count {
        let size_and_type = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| malformed("truncated reference"))?;
        let subsegment_duration = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| malformed("truncated reference"))?;
        let _sap = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| malformed("truncated reference"))?;
        if size_and_type & 0x8000_0000 != 0 {
            return Err(malformed("hierarchical sidx is not supported"));
        }
        let referenced_size = (size_and_type & 0x7fff_ffff) as u64;
        let start_time = time_units as f64 / timescale as f64;
        time_units += subsegment_duration as u64;
        let end_time = time_units as f64 / timescale as f64;
        entries.push(SidxEntry {
            start_byte: next_start_byte,
            end_byte: next_start_byte + referenced_size - 1,
            start_time,
            end_time,
        });
        next_start_byte += referenced_size;
    }
    Ok(entries)
}

/// Scans the top-level boxes of a media segment for `emsg` boxes.
///
/// Malformed trailing data terminates the scan instead of failing the
/// segment; the media itself is appended regardless.
pub fn parse_emsg_boxes(data: &[u8]) -> Vec<EmsgBox> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(header) = read_box_header(data, offset) {
        if &header.box_type == b"emsg" {
            if let Some(emsg) = parse_emsg_payload(&data[header.payload_start..header.box_end]) {
                found.push(emsg);
            }
        }
        if header.box_end <= offset {
            break;
        }
        offset = header.box_end;
    }
    found
}

fn parse_emsg_payload(payload: &[u8]) -> Option<EmsgBox> {
    let mut cursor = Cursor::new(payload);
    let version = cursor.read_u8().ok()?;
    let mut flags = [0u8; 3];
    cursor.read_exact(&mut flags).ok()?;
    match version {
        0 => {
            let scheme_id_uri = read_null_terminated(&mut cursor)?;
            let value = read_null_terminated(&mut cursor)?;
            let timescale = cursor.read_u32::<BigEndian>().ok()?;
            let presentation_time_delta = cursor.read_u32::<BigEndian>().ok()?;
            let event_duration = cursor.read_u32::<BigEndian>().ok()?;
            let id = cursor.read_u32::<BigEndian>().ok()?;
            let message_data = remaining(cursor);
            Some(EmsgBox {
                scheme_id_uri,
                value,
                timescale,
                presentation_time_delta: Some(presentation_time_delta),
                presentation_time: None,
                event_duration,
                id,
                message_data,
            })
        }
        1 => {
            let timescale = cursor.read_u32::<BigEndian>().ok()?;
            let presentation_time = cursor.read_u64::<BigEndian>().ok()?;
            let event_duration = cursor.read_u32::<BigEndian>().ok()?;
            let id = cursor.read_u32::<BigEndian>().ok()?;
            let scheme_id_uri = read_null_terminated(&mut cursor)?;
            let value = read_null_terminated(&mut cursor)?;
            let message_data = remaining(cursor);
            Some(EmsgBox {
                scheme_id_uri,
                value,
                timescale,
                presentation_time_delta: None,
                presentation_time: Some(presentation_time),
                event_duration,
                id,
                message_data,
            })
        }
        _ => None,
    }
}

fn read_null_terminated(cursor: &mut Cursor<&[u8]>) -> Option<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = cursor.read_u8().ok()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).ok()
}

fn remaining(cursor: Cursor<&[u8]>) -> Bytes {
    let position = cursor.position() as usize;
    Bytes::copy_from_slice(&cursor.into_inner()[position..])
}
