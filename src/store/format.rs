//! Region files: binary entries and line-based material extras.
//!
//! Entries file: `[cache_id: 16 bytes][count: i32 LE]` then `count` records
//! as written by [`CacheEntry::write_record`]. Extras file: the cache id as
//! a hyphenated uuid on the first line, the override count on the second,
//! then one JSON object per line.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use crate::core::error::{Error, RecordError};
use crate::core::types::Result;
use crate::entry::{CacheEntry, EntryMap, ExtrasMap, MaterialOverrideEntry};
use crate::region::RegionHandle;

/// Name of the cache directory under the configured location
pub const CACHE_DIR_NAME: &str = "objectcache";

/// File names of one cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    dir: PathBuf,
    prefix: String,
}

impl CachePaths {
    /// Paths under `<location>/objectcache` with the grid prefix
    pub fn new(location: &Path, grid_prefix: &str) -> Self {
        Self {
            dir: location.join(CACHE_DIR_NAME),
            prefix: grid_prefix.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn header(&self) -> PathBuf {
        self.dir.join(format!("{}object.cache", self.prefix))
    }

    pub fn entries(&self, handle: RegionHandle) -> PathBuf {
        let (x, y) = handle.grid_coords();
        self.dir.join(format!("{}objects_{}_{}.slc", self.prefix, x, y))
    }

    pub fn extras(&self, handle: RegionHandle) -> PathBuf {
        let (x, y) = handle.grid_coords();
        self.dir.join(format!("{}objects_{}_{}_extras.slc", self.prefix, x, y))
    }
}

/// Entries read from a region file
#[derive(Debug)]
pub struct LoadedEntries {
    pub entries: EntryMap,
    /// Set when reading stopped at a bad record; `entries` holds the prefix
    pub corruption: Option<RecordError>,
}

/// Read an entries file written for `cache_id`.
///
/// A missing file is an `Io` error with `NotFound`. The file is rejected as
/// a whole on an id mismatch or when its very first record is bad.
pub fn read_entries(path: &Path, cache_id: Uuid, region_name: &str) -> Result<LoadedEntries> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut id = [0u8; 16];
    reader.read_exact(&mut id)?;
    if Uuid::from_bytes(id) != cache_id {
        return Err(Error::CacheIdMismatch {
            region: region_name.to_string(),
        });
    }

    let mut count = [0u8; 4];
    reader.read_exact(&mut count)?;
    let count = i32::from_le_bytes(count).max(0);

    let mut entries = EntryMap::new();
    let mut corruption = None;
    for _ in 0..count {
        match CacheEntry::read_record(&mut reader) {
            Ok(entry) => {
                entries.insert(entry.local_id(), entry);
            }
            Err(e) => {
                corruption = Some(e);
                break;
            }
        }
    }

    match corruption {
        Some(e) if entries.is_empty() => Err(Error::CorruptRecord(e)),
        corruption => Ok(LoadedEntries { entries, corruption }),
    }
}

/// Write an entries file, overwriting any previous content.
///
/// With `removal_enabled` invalidated entries are left out. Entries whose
/// payload cannot be encoded, or with a null local id, are skipped with a
/// warning. Returns the number
/// of records written.
pub fn write_entries(path: &Path, cache_id: Uuid, entries: &EntryMap, removal_enabled: bool) -> Result<usize> {
    let records: Vec<&CacheEntry> = entries
        .values()
        .filter(|e| !removal_enabled || e.is_valid())
        .filter(|e| {
            let ok = e.has_valid_payload() && e.local_id() != 0;
            if !ok {
                log::warn!(
                    "Skipping object {} with a {} byte payload",
                    e.local_id(),
                    e.payload().len()
                );
            }
            ok
        })
        .collect();
    let count = i32::try_from(records.len()).map_err(|_| Error::Format("too many entries".to_string()))?;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(cache_id.as_bytes())?;
    writer.write_all(&count.to_le_bytes())?;
    for entry in &records {
        entry.write_record(&mut writer)?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Overrides read from an extras file
#[derive(Debug, Default)]
pub struct LoadedExtras {
    pub extras: ExtrasMap,
    /// Local ids whose override failed to decode
    pub rejected: Vec<u32>,
}

/// Read an extras file written for `cache_id`.
///
/// A missing file is an `Io` error with `NotFound`. An id mismatch, a bad
/// count or an unparsable line rejects the whole file. Lines with a null
/// local id are skipped; overrides that fail to decode are reported in
/// [`LoadedExtras::rejected`].
pub fn read_extras(path: &Path, cache_id: Uuid, region_name: &str) -> Result<LoadedExtras> {
    let mut lines = BufReader::new(File::open(path)?).lines();

    let id_line = lines.next().transpose()?.unwrap_or_default();
    let id = Uuid::parse_str(id_line.trim()).map_err(|e| Error::Format(format!("bad extras cache id: {}", e)))?;
    if id != cache_id {
        return Err(Error::CacheIdMismatch {
            region: region_name.to_string(),
        });
    }

    let count_line = lines.next().transpose()?.unwrap_or_default();
    let count: usize = match count_line.trim().parse::<i64>() {
        Ok(n) if n > 0 => n as usize,
        _ => return Err(Error::Format(format!("bad extras count {:?}", count_line))),
    };

    let mut loaded = LoadedExtras::default();
    for i in 0..count {
        let Some(line) = lines.next().transpose()? else {
            break;
        };
        let value: Value = serde_json::from_str(&line)
            .map_err(|e| Error::Format(format!("extras entry {}: {}", i, e)))?;

        let local_id = value
            .get("local_id")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if local_id == 0 {
            log::warn!("Null local id for entry {} in extras cache for region: {}", i, region_name);
            continue;
        }

        match MaterialOverrideEntry::from_serialized(&value) {
            Ok(entry) => {
                loaded.extras.insert(local_id, entry);
            }
            Err(e) => {
                log::warn!(
                    "Failed to read entry for local id {} in extras cache for region {}: {}",
                    local_id,
                    region_name,
                    e
                );
                loaded.rejected.push(local_id);
            }
        }
    }
    Ok(loaded)
}

/// Write an extras file, or remove a stale one when `extras` is empty.
pub fn write_extras(path: &Path, cache_id: Uuid, extras: &ExtrasMap) -> Result<()> {
    if extras.is_empty() {
        return match std::fs::remove_file(path) {
            Ok(()) => {
                log::info!("Removed stale extras file: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
    }

    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}", cache_id.hyphenated())?;
    writeln!(writer, "{}", extras.len())?;
    for (local_id, entry) in extras {
        let mut value = entry.to_serialized();
        value["local_id"] = Value::from(*local_id);
        let line = serde_json::to_string(&value).map_err(|e| Error::Format(e.to_string()))?;
        writeln!(writer, "{}", line)?;
    }
    writer.flush()?;
    Ok(())
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
