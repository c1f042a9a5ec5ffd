//! Object cache inspector: dumps header slots and region file summaries.
//!
//! Usage: cargo run --bin vocache_inspect -- [OPTIONS]
//!
//! Options:
//!   --location <DIR>   Directory holding `objectcache/` (default: ".")
//!   --prefix <PREFIX>  Grid prefix of the cache files (default: "")
//!   --region <X,Y>     Also list the entries of one region (grid coords)
//!   --id <UUID>        Cache id of that region (default: read from the file)

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use uuid::Uuid;

use vocache::region::RegionHandle;
use vocache::store::format::{self, CachePaths};
use vocache::store::header::{self, HeaderIndex};

fn main() {
    vocache::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    let location = parse_str_arg(&args, "--location").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let prefix = parse_str_arg(&args, "--prefix").unwrap_or_default();
    let region = parse_str_arg(&args, "--region").and_then(|s| parse_grid(&s));
    let id = parse_str_arg(&args, "--id").and_then(|s| Uuid::parse_str(&s).ok());

    let paths = CachePaths::new(&location, &prefix);
    let header_path = paths.header();
    let (meta, slots) = match header::read_header(&header_path) {
        Ok(Some(header)) => header,
        Ok(None) => {
            log::error!("No object cache header at {}", header_path.display());
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("Failed to read {}: {}", header_path.display(), e);
            std::process::exit(1);
        }
    };

    println!("Header: {}", header_path.display());
    println!(
        "  version {} address size {}{}",
        meta.version,
        meta.address_size,
        if meta.is_current() { "" } else { " (outdated)" }
    );

    let index = HeaderIndex::from_slots(vocache::core::settings::MAX_REGION_SLOTS, &slots);
    println!("  {} resident regions, least recently written first:", index.len());
    for record in index.iter_lru() {
        let entries_path = paths.entries(record.handle);
        let size = std::fs::metadata(&entries_path).map(|m| m.len()).ok();
        println!(
            "  slot {:>3}  region {:<14} time {:>10}  {}",
            record.slot_index,
            record.handle.to_string(),
            record.last_access_time,
            size.map_or_else(|| "missing file".to_string(), |s| format!("{} bytes", s))
        );
    }

    let Some(handle) = region else {
        return;
    };
    let entries_path = paths.entries(handle);
    let Some(cache_id) = id.or_else(|| read_cache_id(&entries_path)) else {
        log::error!("Cannot read cache id from {}", entries_path.display());
        std::process::exit(1);
    };

    println!("Region {} ({})", handle, entries_path.display());
    match format::read_entries(&entries_path, cache_id, &handle.to_string()) {
        Ok(loaded) => {
            let payload: usize = loaded.entries.values().map(|e| e.payload().len()).sum();
            println!("  {} entries, {} payload bytes", loaded.entries.len(), payload);
            for entry in loaded.entries.values() {
                println!(
                    "  id {:>10}  crc {:08x}  {:>5} bytes  hits {} dupes {} crc changes {}",
                    entry.local_id(),
                    entry.crc(),
                    entry.payload().len(),
                    entry.hit_count(),
                    entry.dupe_count(),
                    entry.crc_change_count()
                );
            }
            if let Some(e) = loaded.corruption {
                println!("  file is corrupt past the entries above: {}", e);
            }
        }
        Err(e) => println!("  unreadable: {}", e),
    }

    let extras_path = paths.extras(handle);
    match format::read_extras(&extras_path, cache_id, &handle.to_string()) {
        Ok(loaded) => println!(
            "  {} material overrides ({} rejected)",
            loaded.extras.len(),
            loaded.rejected.len()
        ),
        Err(e) => log::info!("No usable extras file {}: {}", extras_path.display(), e),
    }
}

/// Grid coordinates as "x,y"
fn parse_grid(s: &str) -> Option<RegionHandle> {
    let (x, y) = s.split_once(',')?;
    Some(RegionHandle::from_grid(x.trim().parse().ok()?, y.trim().parse().ok()?))
}

fn read_cache_id(path: &std::path::Path) -> Option<Uuid> {
    let mut bytes = [0u8; 16];
    File::open(path).ok()?.read_exact(&mut bytes).ok()?;
    Some(Uuid::from_bytes(bytes))
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
