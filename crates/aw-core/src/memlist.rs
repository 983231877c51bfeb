// ── MEMLIST ───────────────────────────────────────────────────────────────────
//
// MEMLIST.BIN is a table of 20-byte big-endian records binding resource ids
// (the record index) to a bank file, offset and sizes. The table ends with a
// sentinel record whose state byte is 0xFF.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::Error;

pub const MEMLIST_ENTRY_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Sound,
    Music,
    Bitmap,
    Palette,
    Bytecode,
    Cinematic,
    SubCinematic,
    Unknown(u8),
}

impl ResourceKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => ResourceKind::Sound,
            1 => ResourceKind::Music,
            2 => ResourceKind::Bitmap,
            3 => ResourceKind::Palette,
            4 => ResourceKind::Bytecode,
            5 => ResourceKind::Cinematic,
            6 => ResourceKind::SubCinematic,
            other => ResourceKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotNeeded,
    Loaded,
    RequestedLoad,
    RequestedPurge,
}

#[derive(Debug, Clone)]
pub struct MemEntry {
    pub state: LoadState,
    pub kind: ResourceKind,
    pub rank: u8,
    pub bank_id: u8,
    pub bank_offset: u32,
    pub packed_size: u16,
    pub unpacked_size: u16,
}

/// Parses records until the 0xFF sentinel. The resource id of each entry is
/// its index in the returned table.
pub fn parse<R: Read>(reader: &mut R) -> Result<Vec<MemEntry>, Error> {
    let mut entries = Vec::new();
    loop {
        let state = reader.read_u8()?;
        if state == 0xFF {
            break;
        }
        let kind = ResourceKind::from_byte(reader.read_u8()?);
        let _buf_ptr = reader.read_u16::<BigEndian>()?;
        let _unused = reader.read_u16::<BigEndian>()?;
        let rank = reader.read_u8()?;
        let bank_id = reader.read_u8()?;
        let bank_offset = reader.read_u32::<BigEndian>()?;
        let _unused2 = reader.read_u16::<BigEndian>()?;
        let packed_size = reader.read_u16::<BigEndian>()?;
        let _unused3 = reader.read_u16::<BigEndian>()?;
        let unpacked_size = reader.read_u16::<BigEndian>()?;
        if packed_size > unpacked_size {
            return Err(Error::CorruptAsset {
                resource: entries.len() as u16,
                reason: format!("packed size {packed_size} exceeds unpacked {unpacked_size}"),
            });
        }
        entries.push(MemEntry {
            state: LoadState::NotNeeded,
            kind,
            rank,
            bank_id,
            bank_offset,
            packed_size,
            unpacked_size,
        });
    }
    Ok(entries)
}

#[cfg(test)]
pub(crate) fn encode_entry(e: &MemEntry, kind_byte: u8) -> [u8; MEMLIST_ENTRY_SIZE] {
    let mut rec = [0u8; MEMLIST_ENTRY_SIZE];
    rec[1] = kind_byte;
    rec[6] = e.rank;
    rec[7] = e.bank_id;
    rec[8..12].copy_from_slice(&e.bank_offset.to_be_bytes());
    rec[14..16].copy_from_slice(&e.packed_size.to_be_bytes());
    rec[18..20].copy_from_slice(&e.unpacked_size.to_be_bytes());
    rec
}
