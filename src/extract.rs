use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::scanner::Segment;
use crate::util::{copy_exact, file_len};

/// Dumps every indexed segment of `container` to `<out_dir>/<index>.hca`.
pub fn extract_segments(container: &Path, segments: &[Segment], out_dir: &Path) -> Result<usize> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Create output dir: {}", out_dir.display()))?;

    let file = File::open(container)
        .with_context(|| format!("Open container: {}", container.display()))?;
    let end = file_len(&file).with_context(|| format!("Read length: {}", container.display()))?;
    let mut input = BufReader::new(file);

    for (pos, segment) in segments.iter().enumerate() {
        let next = segments.get(pos + 1).map(|next| next.offset).unwrap_or(end);
        let size = next.saturating_sub(segment.offset);
        let out_path = out_dir.join(format!("{}.hca", segment.index));

        let mut output = BufWriter::new(
            File::create(&out_path)
                .with_context(|| format!("Create segment file: {}", out_path.display()))?,
        );
        input.seek(SeekFrom::Start(segment.offset))?;
        copy_exact(&mut input, &mut output, size)
            .with_context(|| {
                format!("Copy segment {} from {}", segment.index, container.display())
            })?;
        output.flush()?;
    }

    info!(
        container = %container.display(),
        out_dir = %out_dir.display(),
        segments = segments.len(),
        "Extracted segments"
    );
    Ok(segments.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{scan_file, IndexPlan};
    use crate::testutil::{build_container, write_file};

    #[test]
    fn writes_one_file_per_segment() {
        let dir = tempfile::tempdir().unwrap();
        let (bytes, offsets) = build_container(&[100, 150, 130]);
        let container = write_file(dir.path(), "bgm_main.awb", &bytes);
        let segments = scan_file(&container, IndexPlan::Sequential { base: 82 }).unwrap();

        let out_dir = dir.path().join("bgm_main");
        assert_eq!(extract_segments(&container, &segments, &out_dir).unwrap(), 3);

        assert_eq!(fs::read(out_dir.join("82.hca")).unwrap(), &bytes[..100]);
        assert_eq!(fs::read(out_dir.join("83.hca")).unwrap(), &bytes[100..250]);
        assert_eq!(
            fs::read(out_dir.join("84.hca")).unwrap(),
            &bytes[offsets[2] as usize..]
        );
    }
}
