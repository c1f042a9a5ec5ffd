//! Header file listing resident regions and their last access time.
//!
//! Layout (little-endian): an 8 byte meta block `{version, address_size}`
//! followed by [`MAX_REGION_SLOTS`] fixed-size slots
//! `{slot_index: i32, handle: u64, last_access: u32}`. A slot whose access
//! time is [`INVALID_TIME`] is empty. A record always lives at the slot its
//! index names, so a single record can be rewritten in place.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::settings::MAX_REGION_SLOTS;
use crate::region::RegionHandle;

/// Format version written to the meta block
pub const CACHE_VERSION: u32 = 10002;

/// Pointer width of the writer, part of the format identity
pub const ADDRESS_SIZE: u32 = 64;

/// Access time of an empty slot
pub const INVALID_TIME: u32 = 0;

/// Size of the meta block in bytes
pub const META_SIZE: usize = 8;

/// Size of one slot in bytes
pub const SLOT_SIZE: usize = 16;

/// Total size of a well-formed header file
pub const HEADER_FILE_SIZE: usize = META_SIZE + SLOT_SIZE * MAX_REGION_SLOTS as usize;

/// Meta block at the start of the header file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderMeta {
    pub version: u32,
    pub address_size: u32,
}

impl HeaderMeta {
    /// Meta block this build writes
    pub fn current() -> Self {
        Self {
            version: CACHE_VERSION,
            address_size: ADDRESS_SIZE,
        }
    }

    pub fn is_current(&self) -> bool {
        *self == Self::current()
    }

    fn encode(&self) -> [u8; META_SIZE] {
        let mut out = [0u8; META_SIZE];
        out[..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..].copy_from_slice(&self.address_size.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8; META_SIZE]) -> Self {
        Self {
            version: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            address_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// One resident region as stored in the header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionCacheRecord {
    pub handle: RegionHandle,
    /// Unix seconds of the last write, [`INVALID_TIME`] for an empty slot
    pub last_access_time: u32,
    pub slot_index: i32,
}

impl RegionCacheRecord {
    /// Empty slot marker for `slot_index`
    pub fn empty(slot_index: i32) -> Self {
        Self {
            handle: RegionHandle::default(),
            last_access_time: INVALID_TIME,
            slot_index,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_access_time == INVALID_TIME
    }

    fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut out = [0u8; SLOT_SIZE];
        out[..4].copy_from_slice(&self.slot_index.to_le_bytes());
        out[4..12].copy_from_slice(&self.handle.0.to_le_bytes());
        out[12..].copy_from_slice(&self.last_access_time.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8; SLOT_SIZE]) -> Self {
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&bytes[4..12]);
        Self {
            slot_index: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            handle: RegionHandle(u64::from_le_bytes(handle)),
            last_access_time: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }
}

/// Current wall clock in unix seconds, never [`INVALID_TIME`]
pub fn now_secs() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(secs).unwrap_or(u32::MAX).max(1)
}

/// In-memory header: LRU order, handle lookup and slot allocation.
///
/// Order keys are `(last_access_time, sequence)`. Touches take a fresh
/// sequence number, so records sharing a timestamp leave in touch order;
/// records loaded from disk use their slot index as sequence.
#[derive(Debug)]
pub struct HeaderIndex {
    records: HashMap<RegionHandle, (RegionCacheRecord, u64)>,
    lru: BTreeMap<(u32, u64), RegionHandle>,
    free_slots: Vec<i32>,
    next_seq: u64,
    capacity: usize,
}

/// Result of [`HeaderIndex::touch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touch {
    pub record: RegionCacheRecord,
    /// False when the handle was already resident
    pub created: bool,
    /// Records evicted to make room, oldest first
    pub evicted: Vec<RegionCacheRecord>,
}

impl HeaderIndex {
    pub fn new(capacity: u32) -> Self {
        Self {
            records: HashMap::new(),
            lru: BTreeMap::new(),
            // Popped from the back, so slot 0 goes first
            free_slots: (0..MAX_REGION_SLOTS as i32).rev().collect(),
            next_seq: MAX_REGION_SLOTS as u64,
            capacity: capacity.clamp(1, MAX_REGION_SLOTS) as usize,
        }
    }

    /// Rebuild from the slots of a header file. Empty and duplicate slots are
    /// skipped; the position in the file is the slot index.
    pub fn from_slots(capacity: u32, slots: &[RegionCacheRecord]) -> Self {
        let mut index = Self::new(capacity);
        for (position, slot) in slots.iter().enumerate().take(MAX_REGION_SLOTS as usize) {
            if slot.is_empty() || index.records.contains_key(&slot.handle) {
                continue;
            }
            let record = RegionCacheRecord {
                slot_index: position as i32,
                ..*slot
            };
            index.free_slots.retain(|s| *s != record.slot_index);
            index.insert(record, position as u64);
        }
        index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, handle: RegionHandle) -> bool {
        self.records.contains_key(&handle)
    }

    pub fn get(&self, handle: RegionHandle) -> Option<RegionCacheRecord> {
        self.records.get(&handle).map(|(record, _)| *record)
    }

    /// Resident records, least recently used first
    pub fn iter_lru(&self) -> impl Iterator<Item = RegionCacheRecord> + '_ {
        self.lru.values().filter_map(|h| self.get(*h))
    }

    /// Refresh (or create) the record of `handle`, evicting the oldest
    /// records first when a new one would exceed the capacity.
    ///
    /// Returns None when no slot is available.
    pub fn touch(&mut self, handle: RegionHandle, now: u32) -> Option<Touch> {
        let now = now.max(1);
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some((record, old_seq)) = self.records.get(&handle).copied() {
            self.lru.remove(&(record.last_access_time, old_seq));
            let record = RegionCacheRecord {
                last_access_time: now,
                ..record
            };
            self.insert(record, seq);
            return Some(Touch {
                record,
                created: false,
                evicted: Vec::new(),
            });
        }

        let evicted = self.purge_to(self.capacity - 1);
        let slot_index = self.free_slots.pop()?;
        let record = RegionCacheRecord {
            handle,
            last_access_time: now,
            slot_index,
        };
        self.insert(record, seq);
        Some(Touch {
            record,
            created: true,
            evicted,
        })
    }

    /// Forget `handle` and free its slot
    pub fn remove(&mut self, handle: RegionHandle) -> Option<RegionCacheRecord> {
        let (record, seq) = self.records.remove(&handle)?;
        self.lru.remove(&(record.last_access_time, seq));
        self.free_slots.push(record.slot_index);
        Some(record)
    }

    /// Evict the oldest records until at most `size` remain
    pub fn purge_to(&mut self, size: usize) -> Vec<RegionCacheRecord> {
        let mut evicted = Vec::new();
        while self.records.len() > size {
            let Some((_, handle)) = self.lru.pop_first() else {
                break;
            };
            if let Some((record, _)) = self.records.remove(&handle) {
                self.free_slots.push(record.slot_index);
                evicted.push(record);
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.capacity as u32);
    }

    /// Full slot table as laid out on disk
    pub fn slot_table(&self) -> Vec<RegionCacheRecord> {
        let mut slots: Vec<RegionCacheRecord> = (0..MAX_REGION_SLOTS as i32).map(RegionCacheRecord::empty).collect();
        for (record, _) in self.records.values() {
            if let Some(slot) = slots.get_mut(record.slot_index as usize) {
                *slot = *record;
            }
        }
        slots
    }

    fn insert(&mut self, record: RegionCacheRecord, seq: u64) {
        self.lru.insert((record.last_access_time, seq), record.handle);
        self.records.insert(record.handle, (record, seq));
    }
}

/// Read the header file: meta block plus every slot present.
///
/// Returns Ok(None) when the file does not exist. A file shorter than the
/// meta block is an `UnexpectedEof` error; a short slot table keeps the
/// whole slots it has.
pub fn read_header(path: &Path) -> io::Result<Option<(HeaderMeta, Vec<RegionCacheRecord>)>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut meta = [0u8; META_SIZE];
    file.read_exact(&mut meta)?;
    let meta = HeaderMeta::decode(&meta);

    let mut rest = Vec::with_capacity(HEADER_FILE_SIZE - META_SIZE);
    file.read_to_end(&mut rest)?;
    let slots = rest
        .chunks_exact(SLOT_SIZE)
        .take(MAX_REGION_SLOTS as usize)
        .map(|chunk| {
            let mut bytes = [0u8; SLOT_SIZE];
            bytes.copy_from_slice(chunk);
            RegionCacheRecord::decode(&bytes)
        })
        .collect();
    Ok(Some((meta, slots)))
}

/// Write the whole header file: current meta block and every slot
pub fn write_header(path: &Path, index: &HeaderIndex) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_FILE_SIZE);
    buf.extend_from_slice(&HeaderMeta::current().encode());
    for slot in index.slot_table() {
        buf.extend_from_slice(&slot.encode());
    }

    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.flush()
}

/// Rewrite a single slot in place
pub fn write_slot(path: &Path, record: &RegionCacheRecord) -> io::Result<()> {
    if record.slot_index < 0 || record.slot_index >= MAX_REGION_SLOTS as i32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("slot index {} out of range", record.slot_index),
        ));
    }

    let mut file = OpenOptions::new().write(true).open(path)?;
    let offset = META_SIZE + record.slot_index as usize * SLOT_SIZE;
    file.seek(SeekFrom::Start(offset as u64))?;
    file.write_all(&record.encode())?;
    file.flush()
}
