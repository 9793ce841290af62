//! Sidecar file that stores a container's segment index between runs.
//!
//! Each record is `<index>,0x<offset>,` followed by the raw 128-byte header
//! snapshot and a newline. The snapshot is not escaped. It may contain
//! commas and newlines, so it is read by length and never by delimiter.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::scanner::{Segment, HEADER_SNAPSHOT_SIZE};

pub const CACHE_HEADER_LINE: &[u8] = b"Index,Offset,Header\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Awb,
    Asset,
}

impl CacheKind {
    fn suffix(&self) -> &'static str {
        match self {
            CacheKind::Awb => "_headers.csv",
            CacheKind::Asset => "_uasset_headers.csv",
        }
    }
}

pub fn sidecar_path(cache_dir: &Path, container: &Path, kind: CacheKind) -> PathBuf {
    let stem = container
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    cache_dir.join(format!("{stem}{}", kind.suffix()))
}

pub fn write_index<W: Write>(writer: &mut W, segments: &[Segment]) -> io::Result<()> {
    writer.write_all(CACHE_HEADER_LINE)?;
    for segment in segments {
        write!(writer, "{},0x{:x},", segment.index, segment.offset)?;
        writer.write_all(&segment.header)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

pub fn read_index<R: BufRead>(reader: &mut R) -> Result<Vec<Segment>, CacheError> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Err(CacheError::MissingHeaderLine);
    }

    let mut segments = Vec::new();
    let mut field = Vec::new();
    for record in 1.. {
        field.clear();
        if reader.read_until(b',', &mut field)? == 0 {
            break;
        }
        if field.pop() != Some(b',') {
            return Err(CacheError::UnterminatedField {
                record,
                field: "index",
            });
        }
        let index = parse_index(&field, record)?;

        field.clear();
        reader.read_until(b',', &mut field)?;
        if field.pop() != Some(b',') {
            return Err(CacheError::UnterminatedField {
                record,
                field: "offset",
            });
        }
        let offset = parse_offset(&field, record)?;

        let mut header = [0u8; HEADER_SNAPSHOT_SIZE];
        reader.read_exact(&mut header).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => CacheError::TruncatedHeader { record },
            _ => CacheError::Io(err),
        })?;

        segments.push(Segment {
            index,
            offset,
            header,
        });

        let mut terminator = [0u8; 1];
        match reader.read(&mut terminator)? {
            0 => break,
            _ if terminator[0] == b'\n' => {}
            _ => {
                return Err(CacheError::UnexpectedByte {
                    record,
                    byte: terminator[0],
                })
            }
        }
    }
    Ok(segments)
}

fn parse_index(field: &[u8], record: usize) -> Result<u32, CacheError> {
    let invalid = || CacheError::InvalidIndex {
        record,
        value: String::from_utf8_lossy(field).to_string(),
    };
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(invalid)
}

fn parse_offset(field: &[u8], record: usize) -> Result<u64, CacheError> {
    let value = || String::from_utf8_lossy(field).to_string();
    let Some(digits) = field.strip_prefix(b"0x") else {
        return Err(CacheError::MissingHexPrefix {
            record,
            value: value(),
        });
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(CacheError::InvalidOffset {
            record,
            value: value(),
        });
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| u64::from_str_radix(text, 16).ok())
        .ok_or_else(|| CacheError::InvalidOffset {
            record,
            value: value(),
        })
}

/// Writes the cache next to its final location and renames it into place.
pub fn save(path: &Path, segments: &[Segment]) -> Result<(), CacheError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let temp = NamedTempFile::new_in(&dir)?;
    let mut writer = BufWriter::new(temp);
    write_index(&mut writer, segments)?;
    let temp = writer.into_inner().map_err(|err| err.into_error())?;
    temp.persist(path).map_err(|err| err.error)?;

    debug!(path = %path.display(), segments = segments.len(), "Wrote segment cache");
    Ok(())
}

pub fn try_load(path: &Path) -> Result<Option<Vec<Segment>>, CacheError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    read_index(&mut BufReader::new(file)).map(Some)
}

/// Loads a cache, treating an unreadable or malformed file as a miss.
pub fn load(path: &Path) -> Option<Vec<Segment>> {
    match try_load(path) {
        Ok(segments) => segments,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Ignoring unusable segment cache");
            None
        }
    }
}

/// Checks that every cached snapshot still matches the container bytes.
pub fn matches_container<R: Read + Seek>(reader: &mut R, segments: &[Segment]) -> io::Result<bool> {
    let mut current = [0u8; HEADER_SNAPSHOT_SIZE];
    for segment in segments {
        reader.seek(SeekFrom::Start(segment.offset))?;
        match reader.read_exact(&mut current) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(err),
        }
        if current != segment.header {
            return Ok(false);
        }
    }
    Ok(true)
}
