// ── Resource manager ──────────────────────────────────────────────────────────
//
// Loads MEMLIST.BIN once, then serves resources out of the BANK files on
// demand. Payloads are unpacked into reference-counted buffers charged
// against a bump arena; a part switch purges everything and re-binds the
// four per-part segments.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::bytekiller;
use crate::error::Error;
use crate::memlist::{self, LoadState, MemEntry, ResourceKind};
use crate::parts;

/// Size of the load arena; fits the largest shipped part with headroom.
pub const MEM_BLOCK_SIZE: usize = 0x1C_0000;

/// Bump accounting for loaded payloads. There is no per-resource free:
/// `reset` drops everything, `rewind` returns to the post-part-load floor.
#[derive(Debug)]
pub struct Arena {
    capacity: usize,
    used: usize,
    floor: usize,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        Arena { capacity, used: 0, floor: 0 }
    }

    fn charge(&mut self, size: usize) -> bool {
        if self.used + size > self.capacity {
            return false;
        }
        self.used += size;
        true
    }

    fn set_floor(&mut self) {
        self.floor = self.used;
    }

    fn rewind(&mut self) {
        self.used = self.floor;
    }

    fn reset(&mut self) {
        self.used = 0;
        self.floor = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// The four buffers a part binds into the VM and the rasterizer.
#[derive(Clone)]
pub struct PartSegments {
    pub palettes: Arc<[u8]>,
    pub bytecode: Arc<[u8]>,
    pub cinematic: Arc<[u8]>,
    pub sub_cinematic: Option<Arc<[u8]>>,
}

pub struct Resources {
    data_dir: PathBuf,
    entries: Vec<MemEntry>,
    payloads: Vec<Option<Arc<[u8]>>>,
    arena: Arena,
    current_part: u16,
}

impl Resources {
    pub fn open(data_dir: &Path) -> Result<Self, Error> {
        let memlist_path = data_dir.join("MEMLIST.BIN");
        let raw = fs::read(&memlist_path).map_err(|_| Error::MissingData(memlist_path))?;
        let entries = memlist::parse(&mut raw.as_slice())?;
        debug!(target: "resources", "memlist: {} entries", entries.len());
        let payloads = vec![None; entries.len()];
        Ok(Resources {
            data_dir: data_dir.to_path_buf(),
            entries,
            payloads,
            arena: Arena::new(MEM_BLOCK_SIZE),
            current_part: 0,
        })
    }

    pub fn entry(&self, id: u16) -> Option<&MemEntry> {
        self.entries.get(id as usize)
    }

    pub fn resource(&self, id: u16) -> Option<Arc<[u8]>> {
        self.payloads.get(id as usize)?.clone()
    }

    pub fn current_part(&self) -> u16 {
        self.current_part
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Marks a resource for loading. Unknown ids are a logged no-op.
    pub fn request_load(&mut self, id: u16) {
        match self.entries.get_mut(id as usize) {
            Some(e) if e.state == LoadState::NotNeeded => e.state = LoadState::RequestedLoad,
            Some(_) => {}
            None => warn!(target: "resources", "load request for unknown resource {id:#06x}"),
        }
    }

    /// Marks every loaded entry for purging and rewinds the arena. Used on
    /// part change; the caller must have silenced the mixer first.
    pub fn invalidate_all(&mut self) {
        for (e, p) in self.entries.iter_mut().zip(self.payloads.iter_mut()) {
            if e.state == LoadState::Loaded {
                e.state = LoadState::RequestedPurge;
            }
            *p = None;
        }
        self.arena.reset();
    }

    fn flush_purges(&mut self) {
        for e in &mut self.entries {
            if e.state == LoadState::RequestedPurge {
                e.state = LoadState::NotNeeded;
            }
        }
    }

    /// Drops sound, music and bitmap payloads while keeping the bound part
    /// segments; the arena returns to its post-part-load floor.
    pub fn invalidate_transient(&mut self) {
        for (e, p) in self.entries.iter_mut().zip(self.payloads.iter_mut()) {
            let transient = matches!(
                e.kind,
                ResourceKind::Sound | ResourceKind::Music | ResourceKind::Bitmap
            );
            if transient && e.state == LoadState::Loaded {
                e.state = LoadState::NotNeeded;
                *p = None;
            }
        }
        self.arena.rewind();
    }

    /// Services pending load requests in id order. Bitmap payloads are not
    /// retained; they are returned for the caller to copy into page 0.
    pub fn update(&mut self) -> Result<Vec<Arc<[u8]>>, Error> {
        self.flush_purges();
        let mut bitmaps = Vec::new();
        for id in 0..self.entries.len() {
            if self.entries[id].state != LoadState::RequestedLoad {
                continue;
            }
            let payload = self.read_payload(id as u16)?;
            let e = &mut self.entries[id];
            if e.kind == ResourceKind::Bitmap {
                e.state = LoadState::NotNeeded;
                bitmaps.push(payload);
                continue;
            }
            if !self.arena.charge(e.unpacked_size as usize) {
                warn!(target: "resources", "arena full, dropping resource {id:#04x}");
                e.state = LoadState::NotNeeded;
                continue;
            }
            debug!(
                target: "resources",
                "loaded {id:#04x} ({:?}, {} bytes, arena {})",
                e.kind, e.unpacked_size, self.arena.used
            );
            e.state = LoadState::Loaded;
            self.payloads[id] = Some(payload);
        }
        Ok(bitmaps)
    }

    /// Purges everything and loads exactly the four resources of `part`.
    /// All payloads are read before any state is touched, so a failed load
    /// leaves the previous part intact.
    pub fn load_part(&mut self, part: u16) -> Result<PartSegments, Error> {
        let ids = *parts::part_ids(part).ok_or(Error::BadPart(part))?;
        let palettes = self.read_payload(ids.palette)?;
        let bytecode = self.read_payload(ids.bytecode)?;
        let cinematic = self.read_payload(ids.cinematic)?;
        let sub_cinematic = match ids.sub_cinematic {
            Some(id) => Some(self.read_payload(id)?),
            None => None,
        };

        self.invalidate_all();
        self.flush_purges();
        self.bind(ids.palette, palettes.clone());
        self.bind(ids.bytecode, bytecode.clone());
        self.bind(ids.cinematic, cinematic.clone());
        if let (Some(id), Some(p)) = (ids.sub_cinematic, sub_cinematic.clone()) {
            self.bind(id, p);
        }
        self.arena.set_floor();
        self.current_part = part;
        debug!(target: "resources", "part {part:#06x} bound, arena {}", self.arena.used);
        Ok(PartSegments { palettes, bytecode, cinematic, sub_cinematic })
    }

    fn bind(&mut self, id: u16, payload: Arc<[u8]>) {
        let e = &mut self.entries[id as usize];
        if !self.arena.charge(e.unpacked_size as usize) {
            warn!(target: "resources", "part segment {id:#04x} overflows the arena");
        }
        e.state = LoadState::Loaded;
        self.payloads[id as usize] = Some(payload);
    }

    fn read_payload(&self, id: u16) -> Result<Arc<[u8]>, Error> {
        let e = self.entries.get(id as usize).ok_or_else(|| Error::CorruptAsset {
            resource: id,
            reason: "resource id outside MEMLIST".to_string(),
        })?;
        let bank_path = self.data_dir.join(format!("BANK{:02X}", e.bank_id));
        let bank = fs::read(&bank_path).map_err(|_| Error::MissingData(bank_path))?;
        let start = e.bank_offset as usize;
        let end = start + e.packed_size as usize;
        let raw = bank.get(start..end).ok_or_else(|| Error::CorruptAsset {
            resource: id,
            reason: format!("bank {:02X} short read at {start:#x}", e.bank_id),
        })?;
        let bytes = if e.packed_size == e.unpacked_size {
            raw.to_vec()
        } else {
            bytekiller::unpack(raw, e.unpacked_size as usize, id)?
        };
        Ok(bytes.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("aw-res-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(kind: u8, bank: u8, offset: u32, packed: u16, unpacked: u16) -> [u8; 20] {
        let mut rec = [0u8; 20];
        rec[1] = kind;
        rec[7] = bank;
        rec[8..12].copy_from_slice(&offset.to_be_bytes());
        rec[14..16].copy_from_slice(&packed.to_be_bytes());
        rec[18..20].copy_from_slice(&unpacked.to_be_bytes());
        rec
    }

    // Builds a data dir whose ids 0x14..0x16 form part 0x3E80; every other
    // id up to 0x16 is an empty sound entry.
    fn write_fixture(dir: &Path) {
        let palette: Vec<u8> = (0..1024u16).map(|i| i as u8).collect();
        let bytecode = vec![0x11u8; 6]; // HALTs
        let cinematic = vec![0u8; 4];

        let mut bank = Vec::new();
        let pal_off = bank.len() as u32;
        bank.extend_from_slice(&palette);
        let code_off = bank.len() as u32;
        bank.extend_from_slice(&bytecode);
        let cine_off = bank.len() as u32;
        bank.extend_from_slice(&cinematic);
        fs::write(dir.join("BANK01"), &bank).unwrap();

        let mut ml = Vec::new();
        for id in 0..0x17u16 {
            let rec = match id {
                0x14 => record(3, 1, pal_off, 1024, 1024),
                0x15 => record(4, 1, code_off, 6, 6),
                0x16 => record(5, 1, cine_off, 4, 4),
                _ => record(0, 1, 0, 0, 0),
            };
            ml.extend_from_slice(&rec);
        }
        ml.push(0xFF);
        ml.extend_from_slice(&[0u8; 19]);
        let mut f = fs::File::create(dir.join("MEMLIST.BIN")).unwrap();
        f.write_all(&ml).unwrap();
    }

    #[test]
    fn loads_a_part_and_accounts_arena() {
        let dir = fixture_dir("part");
        write_fixture(&dir);
        let mut res = Resources::open(&dir).unwrap();
        let seg = res.load_part(0x3E80).unwrap();
        assert_eq!(seg.palettes.len(), 1024);
        assert_eq!(&seg.bytecode[..], &[0x11; 6]);
        assert!(seg.sub_cinematic.is_none());
        assert_eq!(res.current_part(), 0x3E80);
        assert_eq!(res.arena().used(), 1024 + 6 + 4);
        assert!(res.resource(0x15).is_some());
        assert!(res.resource(0x13).is_none());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn request_and_update_in_id_order() {
        let dir = fixture_dir("update");
        write_fixture(&dir);
        let mut res = Resources::open(&dir).unwrap();
        res.request_load(0x15);
        res.request_load(0x14);
        let bitmaps = res.update().unwrap();
        assert!(bitmaps.is_empty());
        assert!(res.resource(0x14).is_some());
        assert!(res.resource(0x15).is_some());
        // A second update is idle.
        assert!(res.update().unwrap().is_empty());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn bad_part_is_rejected() {
        let dir = fixture_dir("badpart");
        write_fixture(&dir);
        let mut res = Resources::open(&dir).unwrap();
        assert!(matches!(res.load_part(0x1234), Err(Error::BadPart(0x1234))));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn transient_purge_keeps_part_segments() {
        let dir = fixture_dir("purge");
        write_fixture(&dir);
        let mut res = Resources::open(&dir).unwrap();
        res.load_part(0x3E80).unwrap();
        let floor = res.arena().used();
        res.request_load(0x01); // empty sound entry
        res.update().unwrap();
        res.invalidate_transient();
        assert_eq!(res.arena().used(), floor);
        assert!(res.resource(0x15).is_some());
        fs::remove_dir_all(dir).ok();
    }
}
