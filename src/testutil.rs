//! Synthetic containers shared by the unit tests.

use std::fs;
use std::path::{Path, PathBuf};

use crate::scanner::TRACK_SIGNATURE;
use crate::tables::PortMapping;

/// Builds a flat container whose segments have the given sizes. Each
/// segment starts with the track signature and is filled with a byte
/// derived from its position, so neighbouring segments differ.
pub fn build_container(sizes: &[usize]) -> (Vec<u8>, Vec<u64>) {
    let mut bytes = Vec::new();
    let mut offsets = Vec::new();
    for (position, &size) in sizes.iter().enumerate() {
        offsets.push(bytes.len() as u64);
        bytes.extend_from_slice(&segment_bytes(size, 0x10 + position as u8));
    }
    (bytes, offsets)
}

pub fn segment_bytes(size: usize, fill: u8) -> Vec<u8> {
    assert!(size >= TRACK_SIGNATURE.len());
    let mut bytes = vec![fill; size];
    bytes[..TRACK_SIGNATURE.len()].copy_from_slice(&TRACK_SIGNATURE);
    bytes
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, bytes).unwrap();
    path
}

pub fn mapping(awb: &str, acb: &str, tracks: u32, port: i32) -> PortMapping {
    PortMapping {
        awb_name: awb.to_string(),
        acb_name: acb.to_string(),
        tracks,
        port,
    }
}
