use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const COPY_BUFFER_SIZE: usize = 128 * 1024;

pub fn copy_exact<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    mut size: u64,
) -> io::Result<()> {
    let mut buffer = vec![0u8; std::cmp::min(size, COPY_BUFFER_SIZE as u64) as usize];
    while size > 0 {
        let read_size = std::cmp::min(size as usize, buffer.len());
        input.read_exact(&mut buffer[..read_size])?;
        output.write_all(&buffer[..read_size])?;
        size -= read_size as u64;
    }
    Ok(())
}

pub fn write_zeros<W: Write>(writer: &mut W, mut count: u64) -> io::Result<()> {
    let zeros = [0u8; 1024];
    while count > 0 {
        let chunk = std::cmp::min(count, zeros.len() as u64) as usize;
        writer.write_all(&zeros[..chunk])?;
        count -= chunk as u64;
    }
    Ok(())
}

pub fn padding_for_alignment(pos: u64, alignment: u64) -> u64 {
    let rem = pos % alignment;
    if rem == 0 {
        0
    } else {
        alignment - rem
    }
}

pub fn read_u32_le_at<R: Read + Seek>(reader: &mut R, position: u64) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.seek(SeekFrom::Start(position))?;
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_u32_le_at<W: Write + Seek>(
    writer: &mut W,
    position: u64,
    value: u32,
) -> io::Result<()> {
    writer.seek(SeekFrom::Start(position))?;
    writer.write_all(&value.to_le_bytes())
}

pub fn file_len(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// Case-insensitive comparison of two file names, ignoring their extensions.
pub fn same_stem(a: &str, b: &str) -> bool {
    stem_of(a).eq_ignore_ascii_case(stem_of(b))
}

pub fn stem_of(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// `<path>.bak`, keeping the original extension in the name.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}
