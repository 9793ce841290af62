//! Rewrites the AFS2 offset tables that a companion asset keeps for its
//! AWB archives.
//!
//! Entry `l` of a table is a little-endian `u32` at
//! `table_start + 4 * count + 4 * l`. Entries `0..count` hold segment
//! offsets and entry `count` holds the archive's end of file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::editor::SegmentIndex;
use crate::error::{PatchError, PatchResult};
use crate::tables::Tables;
use crate::util::{file_len, read_u32_le_at, same_stem, write_u32_le_at};

pub const TABLE_SIGNATURE: [u8; 4] = *b"AFS2";
pub const LEGACY_LOCATOR: [u8; 4] = [0x20, 0x00, 0xC0, 0x85];
/// Entry counts of the two tables in the legacy layout.
pub const LEGACY_TABLE_SIZES: [u32; 2] = [82, 38];

/// The first table must start within this many bytes of the end of the asset.
const TRAILING_SEARCH_WINDOW: u64 = 2048;
const LEGACY_LOCATOR_WINDOW: usize = 32;
const TABLE_HEADER_LEN: u64 = 16;
const COUNT_FIELD_OFFSET: u64 = 8;
const SEARCH_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableStrategy {
    /// One table per port, sized by the port's track count.
    #[default]
    Ported,
    /// Two fixed tables of 82 and 38 entries.
    Legacy,
}

impl TableStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStrategy::Ported => "ported",
            TableStrategy::Legacy => "legacy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetUpdate {
    /// Write every entry from the edited segment on from the index.
    #[default]
    Absolute,
    /// Add the size difference to the entries after the edited segment.
    /// Experimental.
    Delta,
}

/// A located offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSlot {
    pub ordinal: usize,
    pub signature_pos: u64,
    pub table_start: u64,
    pub entries: u32,
}

impl TableSlot {
    pub fn entry_position(&self, entry: u32) -> u64 {
        self.table_start + 4 * self.entries as u64 + 4 * entry as u64
    }
}

/// Position of the `nth` (zero-based) table signature in `[start, end)`.
pub fn find_signature<R: Read + Seek>(
    reader: &mut R,
    nth: usize,
    start: u64,
    end: u64,
) -> io::Result<Option<u64>> {
    let overlap = TABLE_SIGNATURE.len() as u64 - 1;
    let mut buffer = Vec::with_capacity(SEARCH_BUFFER_SIZE);
    let mut found = 0;
    let mut pos = start;

    while pos < end {
        let want = (end - pos).min(SEARCH_BUFFER_SIZE as u64);
        reader.seek(SeekFrom::Start(pos))?;
        buffer.clear();
        reader.by_ref().take(want).read_to_end(&mut buffer)?;
        if buffer.len() < TABLE_SIGNATURE.len() {
            break;
        }

        for (i, window) in buffer.windows(TABLE_SIGNATURE.len()).enumerate() {
            if window == TABLE_SIGNATURE {
                if found == nth {
                    return Ok(Some(pos + i as u64));
                }
                found += 1;
            }
        }

        if pos + buffer.len() as u64 >= end {
            break;
        }
        pos += buffer.len() as u64 - overlap;
    }
    Ok(None)
}

/// Finds the offset table that belongs to `awb_name` inside `asset`.
///
/// Falls back to the legacy layout when the archive has no mapping row.
pub fn locate_table(
    asset: &Path,
    strategy: TableStrategy,
    tables: &Tables,
    awb_name: &str,
) -> PatchResult<TableSlot> {
    let locate_err = |what: String| PatchError::table_locate(asset, what);

    let mut file = File::open(asset).map_err(|err| locate_err(format!("offset tables ({err})")))?;
    let len = file_len(&file).map_err(|err| locate_err(format!("offset tables ({err})")))?;

    let first = find_signature(&mut file, 0, len.saturating_sub(TRAILING_SEARCH_WINDOW), len)
        .map_err(|err| locate_err(format!("the first AFS2 signature ({err})")))?
        .ok_or_else(|| locate_err("the first AFS2 signature".to_string()))?;

    let mapping = tables.mapping_for_awb(awb_name);
    let strategy = match (strategy, mapping) {
        (TableStrategy::Ported, None) => {
            warn!(awb = awb_name, "No port mapping, using the legacy table layout");
            TableStrategy::Legacy
        }
        (strategy, _) => strategy,
    };

    let nth_signature = |file: &mut File, ordinal: usize| -> PatchResult<u64> {
        if ordinal == 0 {
            return Ok(first);
        }
        find_signature(file, ordinal, first, len)
            .map_err(|err| locate_err(format!("AFS2 signature #{ordinal} ({err})")))?
            .ok_or_else(|| locate_err(format!("AFS2 signature #{ordinal}")))
    };

    let slot = match (strategy, mapping) {
        (TableStrategy::Ported, Some(mapping)) => {
            let ordinal = tables
                .ports_for_acb(&mapping.acb_name)
                .iter()
                .position(|port| same_stem(&port.awb_name, awb_name))
                .unwrap_or(0);
            let signature_pos = nth_signature(&mut file, ordinal)?;
            let declared = read_u32_le_at(&mut file, signature_pos + COUNT_FIELD_OFFSET)
                .map_err(|err| locate_err(format!("the track count of table #{ordinal} ({err})")))?;
            if declared != mapping.tracks {
                warn!(
                    awb = awb_name,
                    declared,
                    mapped = mapping.tracks,
                    "Table track count disagrees with the port mapping"
                );
            }
            TableSlot {
                ordinal,
                signature_pos,
                table_start: signature_pos + TABLE_HEADER_LEN,
                entries: mapping.tracks,
            }
        }
        _ => {
            let start = tables.index_start(awb_name).unwrap_or(0);
            let ordinal = if start < LEGACY_TABLE_SIZES[0] { 0 } else { 1 };
            let signature_pos = nth_signature(&mut file, ordinal)?;
            let table_start = find_locator(&mut file, signature_pos)
                .map_err(|err| locate_err(format!("the table locator ({err})")))?
                .ok_or_else(|| {
                    locate_err(format!("the table locator after AFS2 signature #{ordinal}"))
                })?;
            TableSlot {
                ordinal,
                signature_pos,
                table_start,
                entries: LEGACY_TABLE_SIZES[ordinal],
            }
        }
    };

    debug!(
        awb = awb_name,
        layout = strategy.as_str(),
        ordinal = slot.ordinal,
        table_start = slot.table_start,
        entries = slot.entries,
        "Located offset table"
    );
    Ok(slot)
}

/// Returns the position right after the legacy locator, which must sit
/// within the first bytes of a table header.
fn find_locator(file: &mut File, signature_pos: u64) -> io::Result<Option<u64>> {
    let mut header = [0u8; LEGACY_LOCATOR_WINDOW];
    file.seek(SeekFrom::Start(signature_pos))?;
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    Ok(header
        .windows(LEGACY_LOCATOR.len())
        .position(|window| window == LEGACY_LOCATOR)
        .map(|i| signature_pos + (i + LEGACY_LOCATOR.len()) as u64))
}

fn checked_position(
    asset: &Path,
    slot: &TableSlot,
    entry: u32,
    asset_len: u64,
) -> PatchResult<u64> {
    let position = slot.entry_position(entry);
    if position + 4 > asset_len {
        let reason = format!(
            "table entry {entry} at {position:#x} lies outside the file ({asset_len:#x} bytes)"
        );
        return Err(PatchError::shift(asset, reason));
    }
    Ok(position)
}

fn entry_value(asset: &Path, value: u64) -> PatchResult<u32> {
    u32::try_from(value).map_err(|_| {
        PatchError::shift(asset, format!("offset {value:#x} does not fit a table entry"))
    })
}

fn open_asset(asset: &Path) -> PatchResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(asset)
        .map_err(|err| PatchError::shift(asset, err))
}

fn write_entries(asset: &Path, file: &mut File, writes: &[(u64, u32)]) -> PatchResult<()> {
    let write = |file: &mut File| -> io::Result<()> {
        for &(position, value) in writes {
            write_u32_le_at(file, position, value)?;
        }
        file.flush()
    };
    write(file).map_err(|err| PatchError::shift(asset, err))
}

/// Writes the offsets of segments `from..count` and the archive length at
/// entry `count`. Nothing is written unless every position is in bounds.
pub fn patch_absolute(
    asset: &Path,
    slot: &TableSlot,
    index: &SegmentIndex,
    from: u32,
) -> PatchResult<()> {
    let mut file = open_asset(asset)?;
    let asset_len = file_len(&file).map_err(|err| PatchError::shift(asset, err))?;

    let mut writes = Vec::new();
    for entry in from..=slot.entries {
        let position = checked_position(asset, slot, entry, asset_len)?;
        let value = if entry == slot.entries {
            index.file_len
        } else {
            match index.segments.get(entry as usize) {
                Some(segment) => segment.offset,
                None => {
                    let what = format!(
                        "a segment for table entry {entry}; the table has {} entries \
                         but the archive holds {} segments",
                        slot.entries,
                        index.segments.len()
                    );
                    return Err(PatchError::table_locate(asset, what));
                }
            }
        };
        writes.push((position, entry_value(asset, value)?));
    }

    write_entries(asset, &mut file, &writes)?;
    info!(
        asset = %asset.display(),
        table = slot.ordinal,
        from,
        entries = writes.len(),
        "Updated offset table"
    );
    Ok(())
}

/// Experimental: adds `size_diff` to every entry after `from`, including the
/// end-of-file entry. Agrees with [`patch_absolute`] when the table matched
/// the archive before the edit.
pub fn patch_delta(asset: &Path, slot: &TableSlot, from: u32, size_diff: i64) -> PatchResult<()> {
    let mut file = open_asset(asset)?;
    let asset_len = file_len(&file).map_err(|err| PatchError::shift(asset, err))?;

    let mut writes = Vec::new();
    for entry in from.saturating_add(1)..=slot.entries {
        let position = checked_position(asset, slot, entry, asset_len)?;
        let current =
            read_u32_le_at(&mut file, position).map_err(|err| PatchError::shift(asset, err))?;
        let updated = u64::try_from(current as i64 + size_diff).map_err(|_| {
            PatchError::shift(asset, format!("table entry {entry} would become negative"))
        })?;
        writes.push((position, entry_value(asset, updated)?));
    }

    write_entries(asset, &mut file, &writes)?;
    info!(
        asset = %asset.display(),
        table = slot.ordinal,
        from,
        size_diff,
        "Shifted offset table entries"
    );
    Ok(())
}
