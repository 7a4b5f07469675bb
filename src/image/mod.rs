//! Image I/O: encoding and decoding the persisted object graph (§4.B,
//! §6).
//!
//! Three interoperable binary layouts share one record shape (`{index,
//! class, size, flags}` header + payload words): a monolithic stream
//! with payloads interleaved after each header, a split form with all
//! headers in one stream and all payloads concatenated in a second,
//! and a split-with-ROM-mapping form that additionally lets the reader
//! alias flagged payloads into a shared read-only region instead of
//! copying them onto the heap.
//!
//! Everything here operates on in-memory byte slices - `Vec<u8>` in,
//! `Vec<u8>` out - so the core stays `no_std`; the host binary is the
//! only place that touches a filesystem.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::mem::size_of;

use crate::object::{ObjectEntry, ObjectMemoryError, ObjectTable, Payload};
use crate::oop::{Oop, OopValue};

/// Header flag bits.
pub mod flags {
    /// Set when the object's class is one of the four ROM-eligible
    /// classes (byte arrays, strings, symbols, blocks). All other bits
    /// are zero (§4.B).
    pub const ROM_ELIGIBLE: u16 = 0x0001;
}

/// A fatal image-format condition (§4.B "fail fatally on violation").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// A record's `index` exceeds the table's capacity.
    IndexOutOfRange,
    /// A record's `class` reference names an out-of-range index.
    ClassOutOfRange,
    /// The byte stream ended mid-record.
    Truncated,
    /// The leading root-reference word is missing or malformed.
    BadRootReference,
}

impl From<ObjectMemoryError> for ImageError {
    fn from(_: ObjectMemoryError) -> Self {
        Self::IndexOutOfRange
    }
}

impl core::fmt::Display for ImageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IndexOutOfRange => write!(f, "image: record index out of range"),
            Self::ClassOutOfRange => write!(f, "image: record class out of range"),
            Self::Truncated => write!(f, "image: unexpected end of stream"),
            Self::BadRootReference => write!(f, "image: missing or malformed root reference"),
        }
    }
}

const fn word_size() -> usize {
    size_of::<isize>()
}

fn padded_words(byte_len: usize) -> usize {
    byte_len.div_ceil(word_size())
}

fn write_word(out: &mut Vec<u8>, value: isize) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn read_word(bytes: &[u8], offset: usize) -> Result<isize, ImageError> {
    let width = word_size();
    let slice = bytes.get(offset..offset + width).ok_or(ImageError::Truncated)?;
    let mut buf = [0u8; size_of::<isize>()];
    buf.copy_from_slice(slice);
    Ok(isize::from_ne_bytes(buf))
}

fn pad_to_word_boundary(out: &mut Vec<u8>, byte_len: usize) {
    let pad = padded_words(byte_len) * word_size() - byte_len;
    out.resize(out.len() + pad, 0);
}

struct RecordHeader {
    index: usize,
    class: Oop,
    size: isize,
    flags: u16,
}

#[allow(dead_code)]
const HEADER_BYTES: usize = 4 + word_size() + 2 + 2;

fn write_header(out: &mut Vec<u8>, header: &RecordHeader) {
    out.extend_from_slice(&u32::try_from(header.index).unwrap_or(u32::MAX).to_ne_bytes());
    write_word(out, header.class.as_raw());
    out.extend_from_slice(&(header.size as i16).to_ne_bytes());
    out.extend_from_slice(&header.flags.to_ne_bytes());
}

fn read_header(bytes: &[u8], offset: &mut usize) -> Result<RecordHeader, ImageError> {
    let index_bytes = bytes.get(*offset..*offset + 4).ok_or(ImageError::Truncated)?;
    let index = u32::from_ne_bytes(index_bytes.try_into().unwrap()) as usize;
    *offset += 4;

    let class = Oop::from_raw(read_word(bytes, *offset)?);
    *offset += word_size();

    let size_bytes = bytes.get(*offset..*offset + 2).ok_or(ImageError::Truncated)?;
    let size = i16::from_ne_bytes(size_bytes.try_into().unwrap()) as isize;
    *offset += 2;

    let flags_bytes = bytes.get(*offset..*offset + 2).ok_or(ImageError::Truncated)?;
    let flags = u16::from_ne_bytes(flags_bytes.try_into().unwrap());
    *offset += 2;

    Ok(RecordHeader { index, class, size, flags })
}

fn validate_header(header: &RecordHeader, capacity: usize) -> Result<(), ImageError> {
    if header.index >= capacity {
        return Err(ImageError::IndexOutOfRange);
    }
    if let OopValue::Object(class_index) = header.class.decode() {
        if class_index >= capacity {
            return Err(ImageError::ClassOutOfRange);
        }
    }
    Ok(())
}

fn encode_payload(out: &mut Vec<u8>, entry: &ObjectEntry) -> Result<(), ImageError> {
    match &entry.payload {
        Payload::Slots(slots) => {
            for slot in slots {
                write_word(out, slot.as_raw());
            }
        }
        Payload::Bytes(bytes) => {
            out.extend_from_slice(bytes);
            pad_to_word_boundary(out, bytes.len());
        }
        Payload::Rom { region, start, len, is_bytes } => {
            if *is_bytes {
                let slice = region.get(*start..*start + *len).ok_or(ImageError::Truncated)?;
                out.extend_from_slice(slice);
                pad_to_word_boundary(out, *len);
            } else {
                for i in 0..*len {
                    let word = read_word(region, *start + i * word_size())?;
                    write_word(out, word);
                }
            }
        }
    }
    Ok(())
}

/// Encode every live object in `table` as a monolithic image: the root
/// reference, then each record's header immediately followed by its
/// payload.
///
/// # Errors
/// Propagates `ImageError` if a `Payload::Rom` entry's backing region
/// is shorter than its declared window (a table invariant violation).
pub fn encode_monolithic(
    table: &ObjectTable,
    root: Oop,
    rom_eligible: &[Oop],
) -> Result<Vec<u8>, ImageError> {
    let mut out = Vec::new();
    write_word(&mut out, root.as_raw());
    for (index, entry) in table.iter_entries() {
        // Index 0 is always the implicit pinned `nil` entry, rebuilt by
        // `ObjectTable::new` on load; it is never written out.
        if index == 0 || entry.is_free() {
            continue;
        }
        let flags = if rom_eligible.contains(&entry.class) {
            flags::ROM_ELIGIBLE
        } else {
            0
        };
        write_header(
            &mut out,
            &RecordHeader { index, class: entry.class, size: entry.size, flags },
        );
        encode_payload(&mut out, entry)?;
    }
    Ok(out)
}

/// Encode `table` as a split image: a header stream (root reference
/// then headers only) and a payload stream with payloads concatenated
/// in the same record order. Used for both the plain split format and
/// the split-with-ROM-mapping format - the difference is entirely on
/// the reading side.
///
/// # Errors
/// See [`encode_monolithic`].
pub fn encode_split(
    table: &ObjectTable,
    root: Oop,
    rom_eligible: &[Oop],
) -> Result<(Vec<u8>, Vec<u8>), ImageError> {
    let mut headers = Vec::new();
    let mut payloads = Vec::new();
    write_word(&mut headers, root.as_raw());
    for (index, entry) in table.iter_entries() {
        if index == 0 || entry.is_free() {
            continue;
        }
        let flags = if rom_eligible.contains(&entry.class) {
            flags::ROM_ELIGIBLE
        } else {
            0
        };
        write_header(
            &mut headers,
            &RecordHeader { index, class: entry.class, size: entry.size, flags },
        );
        encode_payload(&mut payloads, entry)?;
    }
    Ok((headers, payloads))
}

/// Read the leading root-reference word shared by all three formats.
fn read_root(bytes: &[u8]) -> Result<(Oop, usize), ImageError> {
    let word = read_word(bytes, 0).map_err(|_| ImageError::BadRootReference)?;
    Ok((Oop::from_raw(word), word_size()))
}

fn install_slots(
    table: &mut ObjectTable,
    header: &RecordHeader,
    words: &[Oop],
) -> Result<(), ImageError> {
    table.install_at(header.index, header.class, header.size, 0, Payload::Slots(words.to_vec()))?;
    Ok(())
}

fn install_bytes(
    table: &mut ObjectTable,
    header: &RecordHeader,
    bytes: Vec<u8>,
) -> Result<(), ImageError> {
    table.install_at(header.index, header.class, header.size, 0, Payload::Bytes(bytes))?;
    Ok(())
}

fn run_root_mark_pass(table: &mut ObjectTable, root: Oop) -> Result<(), ImageError> {
    table.reset_all_refcounts();
    table.mark_from_root(root)?;
    table.rebuild_free_lists();
    Ok(())
}

/// Decode a monolithic image produced by [`encode_monolithic`].
///
/// # Errors
/// `ImageError` on a truncated stream or an out-of-range index/class.
pub fn decode_monolithic(bytes: &[u8], capacity: usize) -> Result<(ObjectTable, Oop), ImageError> {
    let (root, mut offset) = read_root(bytes)?;
    let mut table = ObjectTable::new(capacity);
    while offset < bytes.len() {
        let header = read_header(bytes, &mut offset)?;
        validate_header(&header, capacity)?;
        if header.size >= 0 {
            let count = header.size as usize;
            let mut words = Vec::with_capacity(count);
            for _ in 0..count {
                words.push(Oop::from_raw(read_word(bytes, offset)?));
                offset += word_size();
            }
            install_slots(&mut table, &header, &words)?;
        } else {
            let byte_len = (-header.size) as usize;
            let slice = bytes
                .get(offset..offset + byte_len)
                .ok_or(ImageError::Truncated)?;
            let data = slice.to_vec();
            offset += padded_words(byte_len) * word_size();
            install_bytes(&mut table, &header, data)?;
        }
    }
    run_root_mark_pass(&mut table, root)?;
    Ok((table, root))
}

/// Decode a split-format image, always copying payloads onto the heap
/// (no ROM aliasing). Use [`decode_split_rom`] to pin ROM-eligible
/// payloads instead.
///
/// # Errors
/// `ImageError` on a truncated stream or an out-of-range index/class.
pub fn decode_split(
    header_bytes: &[u8],
    payload_bytes: &[u8],
    capacity: usize,
) -> Result<(ObjectTable, Oop), ImageError> {
    let (root, mut header_offset) = read_root(header_bytes)?;
    let mut payload_offset = 0usize;
    let mut table = ObjectTable::new(capacity);
    while header_offset < header_bytes.len() {
        let header = read_header(header_bytes, &mut header_offset)?;
        validate_header(&header, capacity)?;
        if header.size >= 0 {
            let count = header.size as usize;
            let mut words = Vec::with_capacity(count);
            for _ in 0..count {
                words.push(Oop::from_raw(read_word(payload_bytes, payload_offset)?));
                payload_offset += word_size();
            }
            install_slots(&mut table, &header, &words)?;
        } else {
            let byte_len = (-header.size) as usize;
            let slice = payload_bytes
                .get(payload_offset..payload_offset + byte_len)
                .ok_or(ImageError::Truncated)?;
            let data = slice.to_vec();
            payload_offset += padded_words(byte_len) * word_size();
            install_bytes(&mut table, &header, data)?;
        }
    }
    run_root_mark_pass(&mut table, root)?;
    Ok((table, root))
}

/// Decode a split-with-ROM-mapping image: byte-object entries flagged
/// [`flags::ROM_ELIGIBLE`] are pinned and alias `rom_payload` directly
/// (shared, never copied); every other entry - including ROM-flagged
/// reference objects (Blocks), which `basicAt` has no aliasing
/// accessor for - is copied onto the heap exactly as in
/// [`decode_split`]. This is the reader's prerogative per §4.B ("the
/// reader decides per object whether the payload stays in the
/// read-only payload region or is copied").
///
/// # Errors
/// `ImageError` on a truncated stream or an out-of-range index/class.
pub fn decode_split_rom(
    header_bytes: &[u8],
    rom_payload: Rc<Vec<u8>>,
    capacity: usize,
) -> Result<(ObjectTable, Oop), ImageError> {
    let (root, mut header_offset) = read_root(header_bytes)?;
    let mut payload_offset = 0usize;
    let mut table = ObjectTable::new(capacity);
    while header_offset < header_bytes.len() {
        let header = read_header(header_bytes, &mut header_offset)?;
        validate_header(&header, capacity)?;

        if header.size >= 0 {
            // Reference object: always copied (see doc comment above).
            let count = header.size as usize;
            let mut words = Vec::with_capacity(count);
            for _ in 0..count {
                words.push(Oop::from_raw(read_word(&rom_payload, payload_offset)?));
                payload_offset += word_size();
            }
            install_slots(&mut table, &header, &words)?;
            continue;
        }

        let byte_len = (-header.size) as usize;
        let span = padded_words(byte_len) * word_size();
        if header.flags & flags::ROM_ELIGIBLE != 0 {
            if rom_payload.get(payload_offset..payload_offset + byte_len).is_none() {
                return Err(ImageError::Truncated);
            }
            table.install_at(
                header.index,
                header.class,
                header.size,
                crate::object::PINNED,
                Payload::Rom {
                    region: Rc::clone(&rom_payload),
                    start: payload_offset,
                    len: byte_len,
                    is_bytes: true,
                },
            )?;
        } else {
            let slice = rom_payload
                .get(payload_offset..payload_offset + byte_len)
                .ok_or(ImageError::Truncated)?;
            let data = slice.to_vec();
            install_bytes(&mut table, &header, data)?;
        }
        payload_offset += span;
    }
    run_root_mark_pass(&mut table, root)?;
    Ok((table, root))
}

#[cfg(test)]
mod image_test;
