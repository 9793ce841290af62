//! In-place segment replacement for AWB containers.
//!
//! Fixed-size edits overwrite a segment and zero the leftover space.
//! Variable-size edits move every byte after the segment, then rewrite it.
//! There is no rollback. The `.bak` copy made before the first write is the
//! only way back.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConstraintViolation, PatchError, PatchResult};
use crate::resolver::{EditRequest, HEADER_BLOCK_SIZE};
use crate::scanner::{Segment, HEADER_SNAPSHOT_SIZE, TRACK_SIGNATURE};
use crate::util::{backup_path, copy_exact, file_len, padding_for_alignment, write_zeros};

pub const ALIGNMENT: u64 = 32;

const SHIFT_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeMode {
    /// The replacement must fit in the original segment.
    Fixed,
    /// The container grows or shrinks around the replacement.
    #[default]
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorOptions {
    pub mode: SizeMode,
    /// Round the end of every non-final segment up to [`ALIGNMENT`].
    pub padding: bool,
}

impl Default for EditorOptions {
    fn default() -> Self {
        Self {
            mode: SizeMode::Variable,
            padding: true,
        }
    }
}

/// Segment index of one container together with its current length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIndex {
    pub segments: Vec<Segment>,
    pub file_len: u64,
}

impl SegmentIndex {
    pub fn new(segments: Vec<Segment>, file_len: u64) -> Self {
        Self { segments, file_len }
    }

    /// Position of the segment holding canonical `index`.
    pub fn find(&self, index: u32) -> Option<usize> {
        self.segments.iter().position(|segment| segment.index == index)
    }

    pub fn segment_end(&self, pos: usize) -> u64 {
        self.segments
            .get(pos + 1)
            .map(|next| next.offset)
            .unwrap_or(self.file_len)
    }

    pub fn segment_size(&self, pos: usize) -> u64 {
        self.segment_end(pos).saturating_sub(self.segments[pos].offset)
    }

    /// Moves every segment after `pos`, and the end of file, by `diff`.
    pub fn shift_after(&mut self, pos: usize, diff: i64) {
        for segment in self.segments.iter_mut().skip(pos + 1) {
            segment.offset = segment.offset.saturating_add_signed(diff);
        }
        self.file_len = self.file_len.saturating_add_signed(diff);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditOutcome {
    /// Position of the edited segment in the index.
    pub position: usize,
    pub original_size: u64,
    pub new_size: u64,
    pub padding: u64,
    pub size_diff: i64,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    start: u64,
    content_end: u64,
    total: u64,
    new_size: u64,
    padding: u64,
    size_diff: i64,
}

impl Layout {
    fn new_len(&self) -> u64 {
        self.total.saturating_add_signed(self.size_diff)
    }
}

pub struct ContainerEditor {
    options: EditorOptions,
    chunk_size: usize,
}

impl ContainerEditor {
    pub fn new(options: EditorOptions) -> Self {
        Self {
            options,
            chunk_size: SHIFT_CHUNK_SIZE,
        }
    }

    pub fn options(&self) -> EditorOptions {
        self.options
    }

    /// Rejects a replacement that is not a track, or that does not fit in
    /// fixed-size mode.
    pub fn check_fits(
        &self,
        index: &SegmentIndex,
        request: &EditRequest,
        container: &Path,
    ) -> PatchResult<()> {
        let pos = find_segment(index, request.index, container)?;
        let replacement = replacement_len(&request.source)?;
        if self.options.mode == SizeMode::Variable {
            return Ok(());
        }
        let original = index.segment_size(pos);
        if replacement > original {
            return Err(PatchError::Size {
                index: request.index,
                original,
                replacement,
            });
        }
        Ok(())
    }

    /// Change in container length that applying `request` would cause.
    pub fn size_diff(
        &self,
        index: &SegmentIndex,
        request: &EditRequest,
        container: &Path,
    ) -> PatchResult<i64> {
        let pos = find_segment(index, request.index, container)?;
        let new_size = replacement_len(&request.source)?;
        Ok(self.resize_plan(index, pos, new_size).1)
    }

    /// Padding and size change for writing `new_size` bytes at `pos`.
    fn resize_plan(&self, index: &SegmentIndex, pos: usize, new_size: u64) -> (u64, i64) {
        if self.options.mode == SizeMode::Fixed {
            return (0, 0);
        }
        let is_last = pos + 1 == index.segments.len();
        let padding = if self.options.padding && !is_last {
            padding_for_alignment(index.segments[pos].offset + new_size, ALIGNMENT)
        } else {
            0
        };
        let size_diff = (new_size + padding) as i64 - index.segment_size(pos) as i64;
        (padding, size_diff)
    }

    /// Writes the replacement for `request` into `container` and updates
    /// `index` to the new layout.
    pub fn apply(
        &self,
        container: &Path,
        index: &mut SegmentIndex,
        request: &EditRequest,
    ) -> PatchResult<EditOutcome> {
        let pos = find_segment(index, request.index, container)?;
        let new_size = replacement_len(&request.source)?;
        let original_size = index.segment_size(pos);

        if self.options.mode == SizeMode::Fixed && new_size > original_size {
            return Err(PatchError::Size {
                index: request.index,
                original: original_size,
                replacement: new_size,
            });
        }

        let mut source = File::open(&request.source).map_err(|err| {
            ConstraintViolation::SourceUnreadable {
                source_path: request.source.clone(),
                reason: err.to_string(),
            }
        })?;
        let mut target = OpenOptions::new()
            .read(true)
            .write(true)
            .open(container)
            .map_err(|err| PatchError::shift(container, err))?;

        let start = index.segments[pos].offset;
        let outcome = match self.options.mode {
            SizeMode::Fixed => {
                write_fixed(&mut target, &mut source, start, new_size, original_size)
                    .map_err(|err| PatchError::shift(container, err))?;
                EditOutcome {
                    position: pos,
                    original_size,
                    new_size,
                    padding: 0,
                    size_diff: 0,
                }
            }
            SizeMode::Variable => {
                let (padding, size_diff) = self.resize_plan(index, pos, new_size);
                let total = file_len(&target).map_err(|err| PatchError::shift(container, err))?;
                let content_end = start + original_size;
                if content_end > total {
                    let reason = format!(
                        "segment {} ends at {content_end:#x}, past the end of the file",
                        request.index
                    );
                    return Err(PatchError::shift(container, reason));
                }

                let layout = Layout {
                    start,
                    content_end,
                    total,
                    new_size,
                    padding,
                    size_diff,
                };
                resize_in_place(&mut target, &mut source, &layout, self.chunk_size)
                    .map_err(|err| PatchError::shift(container, err))?;

                index.shift_after(pos, layout.size_diff);
                index.file_len = layout.new_len();
                EditOutcome {
                    position: pos,
                    original_size,
                    new_size,
                    padding,
                    size_diff: layout.size_diff,
                }
            }
        };

        refresh_snapshots(&mut target, &mut index.segments[..=pos], start)
            .map_err(|err| PatchError::shift(container, err))?;

        info!(
            index = request.index,
            offset = start,
            original = original_size,
            replacement = new_size,
            padding = outcome.padding,
            "Replaced segment"
        );
        Ok(outcome)
    }

    /// Overwrites the per-track header block of `index` inside the companion
    /// asset. The block is cut short when the next header starts earlier,
    /// and the rest of the room is zeroed.
    pub fn patch_header_block(
        &self,
        asset: &Path,
        asset_index: &mut SegmentIndex,
        index: u32,
        block: &[u8; HEADER_BLOCK_SIZE],
    ) -> PatchResult<()> {
        let pos = find_segment(asset_index, index, asset)?;
        let start = asset_index.segments[pos].offset;
        let room = match asset_index.segments.get(pos + 1) {
            Some(next) => next.offset.saturating_sub(start),
            None => HEADER_BLOCK_SIZE as u64,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(asset)
            .map_err(|err| PatchError::shift(asset, err))?;
        let len = file_len(&file).map_err(|err| PatchError::shift(asset, err))?;
        if start + room > len {
            let reason = format!(
                "header block for index {index} at {start:#x} runs past the end of the file"
            );
            return Err(PatchError::shift(asset, reason));
        }

        let written = room.min(HEADER_BLOCK_SIZE as u64) as usize;
        let write = |file: &mut File| -> io::Result<()> {
            file.seek(SeekFrom::Start(start))?;
            file.write_all(&block[..written])?;
            write_zeros(file, room - written as u64)?;
            file.flush()
        };
        write(&mut file).map_err(|err| PatchError::shift(asset, err))?;
        refresh_snapshots(&mut file, &mut asset_index.segments[..=pos], start)
            .map_err(|err| PatchError::shift(asset, err))?;

        debug!(index, offset = start, room, "Patched header block");
        Ok(())
    }
}

/// Copies `path` to `path.bak` unless a backup is already there. Returns
/// whether a new backup was written.
pub fn ensure_backup(path: &Path) -> io::Result<bool> {
    let backup = backup_path(path);
    if backup.exists() {
        debug!(backup = %backup.display(), "Backup already present");
        return Ok(false);
    }
    fs::copy(path, &backup)?;
    info!(backup = %backup.display(), "Created backup");
    Ok(true)
}

fn find_segment(index: &SegmentIndex, wanted: u32, container: &Path) -> PatchResult<usize> {
    index.find(wanted).ok_or_else(|| {
        ConstraintViolation::NoSegment {
            index: wanted,
            container: container.to_path_buf(),
        }
        .into()
    })
}

/// Length of a replacement file, which must open with a track header.
fn replacement_len(source: &Path) -> PatchResult<u64> {
    let unreadable = |err: io::Error| ConstraintViolation::SourceUnreadable {
        source_path: source.to_path_buf(),
        reason: err.to_string(),
    };

    let mut file = File::open(source).map_err(unreadable)?;
    let len = file_len(&file).map_err(unreadable)?;
    let mut signature = [0u8; TRACK_SIGNATURE.len()];
    if len >= signature.len() as u64 {
        file.read_exact(&mut signature).map_err(unreadable)?;
    }
    if signature != TRACK_SIGNATURE {
        return Err(ConstraintViolation::NotATrack {
            source_path: source.to_path_buf(),
            len: len as usize,
        }
        .into());
    }
    Ok(len)
}

fn write_fixed(
    target: &mut File,
    source: &mut File,
    start: u64,
    new_size: u64,
    original_size: u64,
) -> io::Result<()> {
    target.seek(SeekFrom::Start(start))?;
    copy_exact(source, target, new_size)?;
    write_zeros(target, original_size - new_size)?;
    target.flush()
}

fn resize_in_place(
    target: &mut File,
    source: &mut File,
    layout: &Layout,
    chunk_size: usize,
) -> io::Result<()> {
    let remaining = layout.total - layout.content_end;
    let mut buffer = vec![0u8; chunk_size];

    if layout.size_diff > 0 {
        // Back to front, so no byte is overwritten before it is moved.
        let mut pos = remaining;
        while pos > 0 {
            let chunk = pos.min(chunk_size as u64);
            let read_pos = layout.content_end + pos - chunk;
            let buf = &mut buffer[..chunk as usize];
            target.seek(SeekFrom::Start(read_pos))?;
            target.read_exact(buf)?;
            target.seek(SeekFrom::Start(read_pos + layout.size_diff as u64))?;
            target.write_all(buf)?;
            pos -= chunk;
        }
    } else if layout.size_diff < 0 {
        let new_tail = layout.start + layout.new_size + layout.padding;
        let mut pos = 0;
        while pos < remaining {
            let chunk = (remaining - pos).min(chunk_size as u64);
            let buf = &mut buffer[..chunk as usize];
            target.seek(SeekFrom::Start(layout.content_end + pos))?;
            target.read_exact(buf)?;
            target.seek(SeekFrom::Start(new_tail + pos))?;
            target.write_all(buf)?;
            pos += chunk;
        }
        target.set_len(layout.new_len())?;
    }

    target.seek(SeekFrom::Start(layout.start))?;
    copy_exact(source, target, layout.new_size)?;
    write_zeros(target, layout.padding)?;
    target.flush()?;

    let expected = layout.new_len();
    if file_len(target)? != expected {
        target.set_len(expected)?;
    }
    debug!(
        shifted = remaining,
        size_diff = layout.size_diff,
        new_len = expected,
        "Shifted container tail"
    );
    Ok(())
}

/// Re-reads the snapshot of every segment whose header window reaches
/// `from` or beyond.
fn refresh_snapshots(file: &mut File, segments: &mut [Segment], from: u64) -> io::Result<()> {
    for segment in segments {
        if segment.offset + HEADER_SNAPSHOT_SIZE as u64 > from {
            segment.header = read_snapshot(file, segment.offset)?;
        }
    }
    Ok(())
}

/// Snapshot of the bytes at `offset`, zero-filled past the end of the file.
fn read_snapshot(file: &mut File, offset: u64) -> io::Result<[u8; HEADER_SNAPSHOT_SIZE]> {
    let mut header = [0u8; HEADER_SNAPSHOT_SIZE];
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < HEADER_SNAPSHOT_SIZE {
        match file.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(header)
}

#[cfg(test)]
impl ContainerEditor {
    fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}
