//! Signature scan that builds the segment index of a container.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::ScanError;
use crate::tables::Tables;

/// Start-of-track marker of an HCA stream.
pub const TRACK_SIGNATURE: [u8; 4] = [0xC8, 0xC3, 0xC1, 0x00];
pub const HEADER_SNAPSHOT_SIZE: usize = 128;

const READ_BUFFER_SIZE: usize = 1024 * 1024;
const SIGNATURE_LEN: usize = TRACK_SIGNATURE.len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub offset: u64,
    pub header: [u8; HEADER_SNAPSHOT_SIZE],
}

/// How scan positions are turned into canonical track indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPlan {
    /// `index = position + base`.
    Sequential { base: u32 },
    /// The first `tail_size` hits belong to the trailing port and are
    /// numbered from `tail_base`; everything after them restarts at 0.
    TailFirst { tail_size: u32, tail_base: u32 },
}

impl Default for IndexPlan {
    fn default() -> Self {
        IndexPlan::Sequential { base: 0 }
    }
}

impl IndexPlan {
    pub fn index_for(&self, position: u32) -> u32 {
        match *self {
            IndexPlan::Sequential { base } => position + base,
            IndexPlan::TailFirst {
                tail_size,
                tail_base,
            } => {
                if position < tail_size {
                    position + tail_base
                } else {
                    position - tail_size
                }
            }
        }
    }

    pub fn for_awb(tables: &Tables, awb_name: &str) -> Self {
        match tables.index_start(awb_name) {
            Some(base) => IndexPlan::Sequential { base },
            None => {
                warn!(awb = awb_name, "Not a recognised archive, numbering tracks from 0");
                IndexPlan::default()
            }
        }
    }

    pub fn for_asset(tables: &Tables, asset_name: &str) -> Self {
        let Some(tail) = tables.tail_port(asset_name) else {
            warn!(asset = asset_name, "No port mapping for asset, numbering headers from 0");
            return IndexPlan::default();
        };
        IndexPlan::TailFirst {
            tail_size: tail.tracks,
            tail_base: tables.index_start(&tail.awb_name).unwrap_or(0),
        }
    }
}

/// Lazily yields every segment of a container in byte order.
///
/// The source is read in bounded chunks. The last few bytes of each chunk
/// are carried over, so a signature split across two reads is still
/// found. A snapshot that runs past the end of the current chunk is
/// completed by reading ahead in the source and seeking back.
pub struct SegmentScanner<R> {
    reader: R,
    plan: IndexPlan,
    buffer: Vec<u8>,
    len: usize,
    cursor: usize,
    buffer_start: u64,
    count: u32,
    chunk_size: usize,
    done: bool,
}

impl<R: Read + Seek> SegmentScanner<R> {
    pub fn new(reader: R, plan: IndexPlan) -> Self {
        Self::with_chunk_size(reader, plan, READ_BUFFER_SIZE)
    }

    pub fn with_chunk_size(mut reader: R, plan: IndexPlan, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(SIGNATURE_LEN);
        let buffer_start = reader.stream_position().unwrap_or(0);
        Self {
            reader,
            plan,
            buffer: vec![0u8; chunk_size + SIGNATURE_LEN],
            len: 0,
            cursor: 0,
            buffer_start,
            count: 0,
            chunk_size,
            done: false,
        }
    }

    fn refill(&mut self) -> io::Result<bool> {
        let keep = self.len - self.cursor.min(self.len);
        self.buffer.copy_within(self.len - keep..self.len, 0);
        self.buffer_start += (self.len - keep) as u64;
        self.len = keep;
        self.cursor = 0;

        let read = loop {
            match self.reader.read(&mut self.buffer[keep..keep + self.chunk_size]) {
                Ok(read) => break read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };
        self.len += read;
        Ok(read > 0)
    }

    fn snapshot(
        &mut self,
        at: usize,
        offset: u64,
    ) -> Result<[u8; HEADER_SNAPSHOT_SIZE], ScanError> {
        let mut header = [0u8; HEADER_SNAPSHOT_SIZE];
        let available = std::cmp::min(self.len - at, HEADER_SNAPSHOT_SIZE);
        header[..available].copy_from_slice(&self.buffer[at..at + available]);

        if available < HEADER_SNAPSHOT_SIZE {
            // The reader sits right after the buffered bytes.
            let resume = self.buffer_start + self.len as u64;
            self.reader
                .read_exact(&mut header[available..])
                .map_err(|err| match err.kind() {
                    io::ErrorKind::UnexpectedEof => ScanError::TruncatedHeader { offset },
                    _ => ScanError::Io(err),
                })?;
            self.reader.seek(SeekFrom::Start(resume))?;
        }
        Ok(header)
    }
}

impl<R: Read + Seek> Iterator for SegmentScanner<R> {
    type Item = Result<Segment, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            while self.cursor + SIGNATURE_LEN <= self.len {
                let at = self.cursor;
                if self.buffer[at..at + SIGNATURE_LEN] != TRACK_SIGNATURE {
                    self.cursor += 1;
                    continue;
                }

                self.cursor = at + SIGNATURE_LEN;
                let offset = self.buffer_start + at as u64;
                return match self.snapshot(at, offset) {
                    Ok(header) => {
                        let index = self.plan.index_for(self.count);
                        self.count += 1;
                        Some(Ok(Segment {
                            index,
                            offset,
                            header,
                        }))
                    }
                    Err(err) => {
                        self.done = true;
                        Some(Err(err))
                    }
                };
            }

            match self.refill() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

/// Scans a whole container. Any failure discards the partial result.
pub fn scan_file(path: &Path, plan: IndexPlan) -> Result<Vec<Segment>, ScanError> {
    let file = File::open(path).map_err(|source| ScanError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let segments = SegmentScanner::new(BufReader::new(file), plan).collect::<Result<Vec<_>, _>>()?;
    debug!(path = %path.display(), segments = segments.len(), "Scanned container");
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_container, mapping};
    use std::io::Cursor;

    fn scan(bytes: Vec<u8>, plan: IndexPlan, chunk: usize) -> Result<Vec<Segment>, ScanError> {
        SegmentScanner::with_chunk_size(Cursor::new(bytes), plan, chunk).collect()
    }

    #[test]
    fn finds_every_segment_in_order() {
        let (bytes, offsets) = build_container(&[100, 150, 150]);
        let segments = scan(bytes.clone(), IndexPlan::default(), READ_BUFFER_SIZE).unwrap();

        assert_eq!(segments.iter().map(|s| s.offset).collect::<Vec<_>>(), offsets);
        assert_eq!(segments.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        for segment in &segments {
            let start = segment.offset as usize;
            assert_eq!(&segment.header[..], &bytes[start..start + HEADER_SNAPSHOT_SIZE]);
        }
    }

    #[test]
    fn small_chunks_give_the_same_index() {
        let (bytes, _) = build_container(&[300, 257, 129, 200]);
        let expected = scan(bytes.clone(), IndexPlan::default(), READ_BUFFER_SIZE).unwrap();
        for chunk in [4, 5, 7, 64, 100, 127, 128, 301] {
            let segments = scan(bytes.clone(), IndexPlan::default(), chunk).unwrap();
            assert_eq!(segments, expected, "chunk size {chunk}");
        }
    }

    #[test]
    fn signature_straddling_a_chunk_boundary_is_found() {
        // The second signature starts two bytes before the first chunk ends.
        let (bytes, offsets) = build_container(&[130, 140]);
        let chunk = offsets[1] as usize + 2;
        let segments = scan(bytes, IndexPlan::default(), chunk).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].offset, offsets[1]);
    }

    #[test]
    fn truncated_header_fails_the_scan() {
        let (mut bytes, _) = build_container(&[200]);
        bytes.extend_from_slice(&TRACK_SIGNATURE);
        bytes.extend_from_slice(&[0x11; 20]);

        let mut scanner = SegmentScanner::new(Cursor::new(bytes), IndexPlan::default());
        assert!(scanner.next().unwrap().is_ok());
        assert!(matches!(
            scanner.next(),
            Some(Err(ScanError::TruncatedHeader { offset: 200 }))
        ));
        assert!(scanner.next().is_none());
    }

    #[test]
    fn base_offset_is_added_to_positions() {
        let (bytes, _) = build_container(&[150, 150]);
        let segments = scan(bytes, IndexPlan::Sequential { base: 82 }, READ_BUFFER_SIZE).unwrap();
        assert_eq!(segments.iter().map(|s| s.index).collect::<Vec<_>>(), vec![82, 83]);
    }

    #[test]
    fn tail_first_plan_renumbers_after_split() {
        let plan = IndexPlan::TailFirst {
            tail_size: 2,
            tail_base: 82,
        };
        let (bytes, _) = build_container(&[150, 150, 150, 150, 150]);
        let segments = scan(bytes, plan, READ_BUFFER_SIZE).unwrap();
        assert_eq!(
            segments.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![82, 83, 0, 1, 2]
        );
    }

    #[test]
    fn plans_follow_port_mapping() {
        let tables = Tables {
            mappings: vec![
                mapping("bgm_main.awb", "bgm_main.acb", 82, 0),
                mapping("bgm_main_Cnk_00.awb", "bgm_main.acb", 38, 1),
            ],
            ..Tables::default()
        };

        assert_eq!(
            IndexPlan::for_awb(&tables, "bgm_main_Cnk_00.awb"),
            IndexPlan::Sequential { base: 82 }
        );
        assert_eq!(
            IndexPlan::for_asset(&tables, "bgm_main.uasset"),
            IndexPlan::TailFirst {
                tail_size: 38,
                tail_base: 82
            }
        );
        assert_eq!(IndexPlan::for_awb(&tables, "other.awb"), IndexPlan::default());
    }

    #[test]
    fn scan_file_reports_missing_container() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_file(&dir.path().join("missing.awb"), IndexPlan::default()).unwrap_err();
        assert!(matches!(err, ScanError::Open { .. }));
    }
}
