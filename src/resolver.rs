//! Turns replacement files into validated edit requests and groups them by
//! the companion asset that owns their offset tables.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ConstraintViolation;
use crate::scanner::TRACK_SIGNATURE;
use crate::tables::{DictionaryEntry, Tables};
use crate::util::{file_name_of, stem_of};

pub const HEADER_BLOCK_SIZE: usize = 6144;

const COMPANION_EXTENSIONS: [&str; 2] = ["uasset", "acb"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    pub index: u32,
    pub header_block: Box<[u8; HEADER_BLOCK_SIZE]>,
    /// Set on requests synthesized from a pair rule.
    pub paired_from: Option<u32>,
}

#[derive(Debug)]
pub struct Rejection {
    pub source: PathBuf,
    pub reason: ConstraintViolation,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub requests: Vec<EditRequest>,
    pub rejections: Vec<Rejection>,
}

/// Requests that share one companion asset.
#[derive(Debug)]
pub struct Batch {
    pub companion: PathBuf,
    pub requests: Vec<EditRequest>,
}

pub struct Resolver<'a> {
    tables: &'a Tables,
}

impl<'a> Resolver<'a> {
    pub fn new(tables: &'a Tables) -> Self {
        Self { tables }
    }

    pub fn resolve(&self, sources: &[PathBuf], container_root: &Path) -> Resolution {
        let mut sources = sources.to_vec();
        sources.sort();

        let mut resolution = Resolution::default();
        let mut queued = HashSet::new();
        for source in sources {
            let outcome =
                self.resolve_one(&source, container_root, &mut queued, &mut resolution.requests);
            if let Err(reason) = outcome {
                resolution.rejections.push(Rejection { source, reason });
            }
        }
        resolution
    }

    fn resolve_one(
        &self,
        source: &Path,
        container_root: &Path,
        queued: &mut HashSet<u32>,
        requests: &mut Vec<EditRequest>,
    ) -> Result<(), ConstraintViolation> {
        let name = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();

        // A cue can be listed for several archives; the first usable row wins.
        let mut first_failure = None;
        let mut chosen = None;
        for entry in self.tables.lookup(&name) {
            if self.tables.is_banned(entry.index) {
                first_failure.get_or_insert(ConstraintViolation::Banned { index: entry.index });
                continue;
            }
            match existing_target(entry, container_root) {
                Some(target) => {
                    chosen = Some((entry.index, target));
                    break;
                }
                None => {
                    first_failure.get_or_insert(ConstraintViolation::MissingTarget {
                        index: entry.index,
                        target: container_root.join(&entry.target_file),
                    });
                }
            }
        }
        let Some((index, target)) = chosen else {
            return Err(first_failure.unwrap_or(ConstraintViolation::Unmatched { name }));
        };

        let partner_queued = self
            .tables
            .partners(index)
            .any(|partner| queued.contains(&partner));
        if queued.contains(&index) || partner_queued {
            return Err(ConstraintViolation::Duplicate { index });
        }
        let header_block = read_header_block(source)?;

        debug!(source = %source.display(), index, "Queued replacement");
        queued.insert(index);
        requests.push(EditRequest {
            source: source.to_path_buf(),
            target,
            index,
            header_block,
            paired_from: None,
        });
        let request = requests.len() - 1;

        let mut pending = vec![index];
        while let Some(current) = pending.pop() {
            for partner in self.tables.partners(current) {
                if queued.contains(&partner) {
                    continue;
                }
                if self.tables.is_banned(partner) {
                    debug!(index = partner, "Paired index is protected, not linking");
                    continue;
                }
                let Some(partner_entry) = self.tables.entry_for_index(partner) else {
                    warn!(index = partner, "Paired index has no dictionary entry");
                    continue;
                };
                let Some(partner_target) = existing_target(partner_entry, container_root) else {
                    warn!(
                        index = partner,
                        target = %partner_entry.target_file,
                        "Paired target file not found"
                    );
                    continue;
                };

                debug!(index = partner, linked_to = current, "Queued paired replacement");
                queued.insert(partner);
                let header_block = requests[request].header_block.clone();
                requests.push(EditRequest {
                    source: source.to_path_buf(),
                    target: partner_target,
                    index: partner,
                    header_block,
                    paired_from: Some(current),
                });
                pending.push(partner);
            }
        }
        Ok(())
    }

    /// Groups requests by companion asset, keeping the order in which each
    /// companion is first seen.
    pub fn group_by_companion(
        &self,
        requests: Vec<EditRequest>,
        container_root: &Path,
    ) -> (Vec<Batch>, Vec<Rejection>) {
        let mut batches: Vec<Batch> = Vec::new();
        let mut rejections = Vec::new();

        for request in requests {
            let Some(companion) = self.companion_for(&request.target, container_root) else {
                rejections.push(Rejection {
                    source: request.source.clone(),
                    reason: ConstraintViolation::MissingCompanion {
                        target: request.target.clone(),
                    },
                });
                continue;
            };

            match batches.iter_mut().find(|batch| batch.companion == companion) {
                Some(batch) => batch.requests.push(request),
                None => batches.push(Batch {
                    companion,
                    requests: vec![request],
                }),
            }
        }
        (batches, rejections)
    }

    fn companion_for(&self, target: &Path, container_root: &Path) -> Option<PathBuf> {
        let awb_name = file_name_of(target);
        let stem = match self.tables.mapping_for_awb(&awb_name) {
            Some(mapping) => stem_of(&mapping.acb_name).to_string(),
            None => stem_of(&awb_name).to_string(),
        };
        COMPANION_EXTENSIONS
            .iter()
            .map(|extension| container_root.join(format!("{stem}.{extension}")))
            .find(|candidate| candidate.is_file())
    }
}

fn existing_target(entry: &DictionaryEntry, container_root: &Path) -> Option<PathBuf> {
    let target = container_root.join(&entry.target_file);
    target.is_file().then_some(target)
}

/// Reads the leading header block of a replacement file, zero-padding a
/// short file. The file must start with a track header.
pub fn read_header_block(
    source: &Path,
) -> Result<Box<[u8; HEADER_BLOCK_SIZE]>, ConstraintViolation> {
    let unreadable = |err: std::io::Error| ConstraintViolation::SourceUnreadable {
        source_path: source.to_path_buf(),
        reason: err.to_string(),
    };

    let file = File::open(source).map_err(unreadable)?;
    let mut bytes = Vec::with_capacity(HEADER_BLOCK_SIZE);
    file.take(HEADER_BLOCK_SIZE as u64)
        .read_to_end(&mut bytes)
        .map_err(unreadable)?;
    if !bytes.starts_with(&TRACK_SIGNATURE) {
        return Err(ConstraintViolation::NotATrack {
            source_path: source.to_path_buf(),
            len: bytes.len(),
        });
    }
    if bytes.len() < HEADER_BLOCK_SIZE {
        warn!(
            source = %source.display(),
            read = bytes.len(),
            "Replacement is shorter than a header block, padding with zeros"
        );
    }

    let mut block = Box::new([0u8; HEADER_BLOCK_SIZE]);
    block[..bytes.len()].copy_from_slice(&bytes);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{BanRule, PairRule};
    use crate::testutil::{mapping, segment_bytes, write_file};

    fn entry(cue: &str, target: &str, index: u32) -> DictionaryEntry {
        DictionaryEntry {
            cue_name: cue.to_string(),
            target_file: target.to_string(),
            index,
        }
    }

    fn sample_tables() -> Tables {
        Tables {
            dictionary: vec![
                entry("Title", "bgm_main.awb", 1),
                entry("Title_Intro", "bgm_main.awb", 2),
                entry("Boss", "bgm_main_Cnk_00.awb", 83),
                entry("Boss_Loop", "bgm_main_Cnk_00.awb", 84),
                entry("Ending", "bgm_main.awb", 5),
                entry("Credits", "bgm_missing.awb", 7),
                entry("Extra", "bgm_extra.awb", 9),
            ],
            mappings: vec![
                mapping("bgm_main.awb", "bgm_main.acb", 82, 0),
                mapping("bgm_main_Cnk_00.awb", "bgm_main.acb", 38, 1),
            ],
            pairs: vec![PairRule(1, 2), PairRule(83, 84), PairRule(84, 5)],
            bans: vec![BanRule::Single(5)],
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        write_file(&root, "bgm_main.awb", &[0; 16]);
        write_file(&root, "bgm_main_Cnk_00.awb", &[0; 16]);
        write_file(&root, "bgm_extra.awb", &[0; 16]);
        write_file(&root, "bgm_main.uasset", &[0; 16]);
        (dir, root)
    }

    #[test]
    fn header_block_is_zero_padded() {
        let (_dir, root) = fixture();
        let content = segment_bytes(100, 0xAB);
        let source = write_file(&root, "in/Title.hca", &content);
        let block = read_header_block(&source).unwrap();
        assert_eq!(&block[..100], &content[..]);
        assert!(block[100..].iter().all(|&b| b == 0));

        let content = segment_bytes(HEADER_BLOCK_SIZE + 10, 0xCD);
        let long = write_file(&root, "in/Long.hca", &content);
        let block = read_header_block(&long).unwrap();
        assert_eq!(&block[..], &content[..HEADER_BLOCK_SIZE]);
    }

    #[test]
    fn pairs_are_expanded_into_sibling_requests() {
        let (_dir, root) = fixture();
        let tables = sample_tables();
        let source = write_file(&root, "in/title.hca", &segment_bytes(32, 1));

        let resolution = Resolver::new(&tables).resolve(&[source.clone()], &root);
        assert!(resolution.rejections.is_empty());
        let indices: Vec<u32> = resolution.requests.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(resolution.requests[1].source, source);
        assert_eq!(resolution.requests[1].paired_from, Some(1));
        assert_eq!(resolution.requests[0].header_block, resolution.requests[1].header_block);
    }

    #[test]
    fn pair_closure_skips_protected_partners() {
        let (_dir, root) = fixture();
        let tables = sample_tables();
        let source = write_file(&root, "in/Boss.hca", &segment_bytes(32, 1));

        let resolution = Resolver::new(&tables).resolve(&[source], &root);
        let indices: Vec<u32> = resolution.requests.iter().map(|r| r.index).collect();
        // 84 links on to 5, which is protected.
        assert_eq!(indices, vec![83, 84]);
        assert_eq!(resolution.requests[1].paired_from, Some(83));
    }

    #[test]
    fn partner_already_queued_rejects_the_later_file() {
        let (_dir, root) = fixture();
        let tables = sample_tables();
        let second = write_file(&root, "in/Title_Intro.hca", &segment_bytes(32, 2));
        // Sorts first and pulls in index 2 through its pair.
        let title = write_file(&root, "in/00001.hca", &segment_bytes(32, 3));
        let resolution = Resolver::new(&tables).resolve(&[second.clone(), title], &root);

        let indices: Vec<u32> = resolution.requests.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(resolution.rejections.len(), 1);
        assert_eq!(resolution.rejections[0].source, second);
        assert!(matches!(
            resolution.rejections[0].reason,
            ConstraintViolation::Duplicate { index: 2 }
        ));
    }

    #[test]
    fn rejections_carry_their_reason() {
        let (_dir, root) = fixture();
        let tables = sample_tables();
        let sources = vec![
            write_file(&root, "in/Unknown.hca", &segment_bytes(8, 0)),
            write_file(&root, "in/Ending.hca", &segment_bytes(8, 0)),
            write_file(&root, "in/Credits.hca", &segment_bytes(8, 0)),
        ];

        let resolution = Resolver::new(&tables).resolve(&sources, &root);
        assert!(resolution.requests.is_empty());
        let reasons: Vec<&ConstraintViolation> =
            resolution.rejections.iter().map(|r| &r.reason).collect();
        assert!(matches!(reasons[0], ConstraintViolation::MissingTarget { index: 7, .. }));
        assert!(matches!(reasons[1], ConstraintViolation::Banned { index: 5 }));
        assert!(matches!(reasons[2], ConstraintViolation::Unmatched { name } if name == "Unknown"));
    }

    #[test]
    fn requests_are_grouped_by_companion() {
        let (_dir, root) = fixture();
        let tables = sample_tables();
        let sources = vec![
            write_file(&root, "in/Title.hca", &segment_bytes(8, 0)),
            write_file(&root, "in/Boss.hca", &segment_bytes(8, 0)),
            write_file(&root, "in/Extra.hca", &segment_bytes(8, 0)),
        ];

        let resolver = Resolver::new(&tables);
        let resolution = resolver.resolve(&sources, &root);
        let (batches, rejections) = resolver.group_by_companion(resolution.requests, &root);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].companion, root.join("bgm_main.uasset"));
        let indices: Vec<u32> = batches[0].requests.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![83, 84, 1, 2]);

        assert_eq!(rejections.len(), 1);
        assert!(matches!(
            rejections[0].reason,
            ConstraintViolation::MissingCompanion { .. }
        ));
    }

    #[test]
    fn unmapped_archive_falls_back_to_its_own_stem() {
        let (_dir, root) = fixture();
        write_file(&root, "bgm_extra.acb", &[0; 8]);
        let tables = sample_tables();
        let source = write_file(&root, "in/Extra.hca", &segment_bytes(8, 0));

        let resolver = Resolver::new(&tables);
        let resolution = resolver.resolve(&[source], &root);
        let (batches, rejections) = resolver.group_by_companion(resolution.requests, &root);
        assert!(rejections.is_empty());
        assert_eq!(batches[0].companion, root.join("bgm_extra.acb"));
    }

    #[test]
    fn first_row_with_an_existing_target_wins() {
        let (_dir, root) = fixture();
        let mut tables = sample_tables();
        tables.dictionary.push(entry("Finale", "bgm_missing.awb", 10));
        tables.dictionary.push(entry("Finale", "bgm_main_Cnk_00.awb", 90));
        let source = write_file(&root, "in/Finale.hca", &segment_bytes(32, 4));

        let resolution = Resolver::new(&tables).resolve(&[source], &root);
        assert!(resolution.rejections.is_empty());
        assert_eq!(resolution.requests.len(), 1);
        assert_eq!(resolution.requests[0].index, 90);
        assert_eq!(resolution.requests[0].target, root.join("bgm_main_Cnk_00.awb"));
    }

    #[test]
    fn protected_row_falls_through_to_the_next_match() {
        let (_dir, root) = fixture();
        let mut tables = sample_tables();
        tables.dictionary.insert(0, entry("Extra", "bgm_main.awb", 5));
        let source = write_file(&root, "in/Extra.hca", &segment_bytes(32, 4));

        let resolution = Resolver::new(&tables).resolve(&[source], &root);
        assert_eq!(resolution.requests[0].index, 9);
    }

    #[test]
    fn replacement_must_start_with_a_track_header() {
        let (_dir, root) = fixture();
        let tables = sample_tables();
        let sources = vec![
            write_file(&root, "in/Extra.hca", &[]),
            write_file(&root, "in/Title.hca", &[0x55; 64]),
        ];

        let resolution = Resolver::new(&tables).resolve(&sources, &root);
        assert!(resolution.requests.is_empty());
        assert_eq!(resolution.rejections.len(), 2);
        assert!(matches!(
            resolution.rejections[0].reason,
            ConstraintViolation::NotATrack { len: 0, .. }
        ));
        assert!(matches!(
            resolution.rejections[1].reason,
            ConstraintViolation::NotATrack { len: 64, .. }
        ));
    }
}
