//! In-memory lookup tables handed to the resolver and the patchers.
//!
//! The CSV files are produced by external tooling. Each one has a header
//! row, and columns are read by position rather than by header name.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::util::same_stem;

pub const DICTIONARY_FILE: &str = "bgm_dictionary.csv";
pub const MAPPING_FILE: &str = "acb_mapping.csv";
pub const PAIRS_FILE: &str = "hca_pairs.csv";
pub const BANNED_FILE: &str = "protected_indices.csv";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DictionaryEntry {
    pub cue_name: String,
    pub target_file: String,
    pub index: u32,
}

/// One AWB port of a companion asset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortMapping {
    pub awb_name: String,
    pub acb_name: String,
    pub tracks: u32,
    pub port: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairRule(pub u32, pub u32);

impl PairRule {
    pub fn partner_of(&self, index: u32) -> Option<u32> {
        if self.0 == index {
            Some(self.1)
        } else if self.1 == index {
            Some(self.0)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanRule {
    Single(u32),
    Range { lo: u32, hi: u32 },
}

impl BanRule {
    /// A row is an inclusive range unless its second value is below the
    /// first, in which case only the first value is banned.
    pub fn from_row(first: u32, second: i64) -> Self {
        if second < first as i64 {
            BanRule::Single(first)
        } else {
            BanRule::Range {
                lo: first,
                hi: second.min(u32::MAX as i64) as u32,
            }
        }
    }

    pub fn covers(&self, index: u32) -> bool {
        match *self {
            BanRule::Single(banned) => banned == index,
            BanRule::Range { lo, hi } => (lo..=hi).contains(&index),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PairRow(u32, u32);

#[derive(Debug, Deserialize)]
struct BanRow(i64, i64);

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub dictionary: Vec<DictionaryEntry>,
    pub mappings: Vec<PortMapping>,
    pub pairs: Vec<PairRule>,
    pub bans: Vec<BanRule>,
}

impl Tables {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let dictionary: Vec<DictionaryEntry> = read_table(&data_dir.join(DICTIONARY_FILE))?;
        let mappings: Vec<PortMapping> = read_table(&data_dir.join(MAPPING_FILE))?;
        let pairs = read_table::<PairRow>(&data_dir.join(PAIRS_FILE))?
            .into_iter()
            .map(|PairRow(a, b)| PairRule(a, b))
            .collect();

        let mut bans = Vec::new();
        for BanRow(first, second) in read_table::<BanRow>(&data_dir.join(BANNED_FILE))? {
            match u32::try_from(first) {
                Ok(first) => bans.push(BanRule::from_row(first, second)),
                Err(_) => warn!(first, second, "Ignoring protected index row with negative index"),
            }
        }

        let tables = Self {
            dictionary,
            mappings,
            pairs,
            bans,
        };
        debug!(
            dictionary = tables.dictionary.len(),
            mappings = tables.mappings.len(),
            pairs = tables.pairs.len(),
            bans = tables.bans.len(),
            "Loaded lookup tables"
        );
        Ok(tables)
    }

    /// Dictionary rows matching a replacement file's stem, in table order.
    /// A stem matches a cue name, or the canonical index when it is a plain
    /// number (`12`, `00012`).
    pub fn lookup<'a>(&'a self, stem: &'a str) -> impl Iterator<Item = &'a DictionaryEntry> + 'a {
        let literal = parse_literal_index(stem);
        self.dictionary.iter().filter(move |entry| {
            entry.cue_name.eq_ignore_ascii_case(stem) || Some(entry.index) == literal
        })
    }

    pub fn entry_for_index(&self, index: u32) -> Option<&DictionaryEntry> {
        self.dictionary.iter().find(|entry| entry.index == index)
    }

    pub fn is_banned(&self, index: u32) -> bool {
        self.bans.iter().any(|rule| rule.covers(index))
    }

    pub fn partners(&self, index: u32) -> impl Iterator<Item = u32> + '_ {
        self.pairs.iter().filter_map(move |pair| pair.partner_of(index))
    }

    pub fn mapping_for_awb(&self, awb_name: &str) -> Option<&PortMapping> {
        self.mappings
            .iter()
            .find(|mapping| same_stem(&mapping.awb_name, awb_name))
    }

    /// First canonical index stored in `awb_name`: the sum of the track
    /// counts of every mapping row listed before it.
    pub fn index_start(&self, awb_name: &str) -> Option<u32> {
        let mut start = 0u32;
        for mapping in &self.mappings {
            if same_stem(&mapping.awb_name, awb_name) {
                return Some(start);
            }
            start = start.saturating_add(mapping.tracks);
        }
        None
    }

    /// Ports of one companion asset, ordered by port number.
    pub fn ports_for_acb(&self, acb_name: &str) -> Vec<&PortMapping> {
        let mut ports: Vec<&PortMapping> = self
            .mappings
            .iter()
            .filter(|mapping| same_stem(&mapping.acb_name, acb_name))
            .collect();
        ports.sort_by_key(|mapping| mapping.port);
        ports
    }

    /// The highest-numbered port of a companion asset. Its headers come
    /// first in the asset's file order.
    pub fn tail_port(&self, acb_name: &str) -> Option<&PortMapping> {
        self.mappings
            .iter()
            .filter(|mapping| same_stem(&mapping.acb_name, acb_name))
            .fold(None, |best: Option<&PortMapping>, mapping| match best {
                Some(current) if current.port >= mapping.port => Some(current),
                _ => Some(mapping),
            })
    }
}

fn parse_literal_index(stem: &str) -> Option<u32> {
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Open table: {}", path.display()))?;
    parse_table(file).with_context(|| format!("Parse table: {}", path.display()))
}

fn parse_table<T: DeserializeOwned, R: Read>(reader: R) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Read row {}", row + 1))?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        let value = record
            .deserialize(None)
            .with_context(|| format!("Decode row {}", row + 1))?;
        rows.push(value);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mapping;
    use std::fs;

    #[test]
    fn range_ban_covers_inclusive_bounds() {
        let rule = BanRule::from_row(10, 20);
        assert!(rule.covers(10));
        assert!(rule.covers(15));
        assert!(rule.covers(20));
        assert!(!rule.covers(9));
        assert!(!rule.covers(21));
    }

    #[test]
    fn reversed_ban_degenerates_to_single_index() {
        let rule = BanRule::from_row(82, -1);
        assert_eq!(rule, BanRule::Single(82));
        assert!(rule.covers(82));
        assert!(!rule.covers(81));

        let rule = BanRule::from_row(86, 5);
        assert_eq!(rule, BanRule::Single(86));
        assert!(!rule.covers(5));
        assert!(!rule.covers(50));
    }

    #[test]
    fn equal_bounds_ban_one_index() {
        let rule = BanRule::from_row(7, 7);
        assert!(rule.covers(7));
        assert!(!rule.covers(8));
    }

    #[test]
    fn lookup_matches_cue_name_or_literal_index() {
        let tables = Tables {
            dictionary: vec![
                DictionaryEntry {
                    cue_name: "Title_Theme".into(),
                    target_file: "bgm_main.awb".into(),
                    index: 12,
                },
                DictionaryEntry {
                    cue_name: "Battle_01".into(),
                    target_file: "bgm_main_Cnk_00.awb".into(),
                    index: 90,
                },
                DictionaryEntry {
                    cue_name: "Title_Theme".into(),
                    target_file: "bgm_DLC_01.awb".into(),
                    index: 130,
                },
            ],
            ..Tables::default()
        };

        let titles: Vec<u32> = tables.lookup("title_theme").map(|e| e.index).collect();
        assert_eq!(titles, vec![12, 130]);
        assert_eq!(tables.lookup("00090").next().map(|e| e.index), Some(90));
        assert_eq!(tables.lookup("90").next().map(|e| e.index), Some(90));
        assert!(tables.lookup("+90").next().is_none());
        assert!(tables.lookup("Unknown").next().is_none());
    }

    #[test]
    fn index_start_sums_preceding_tracks() {
        let tables = Tables {
            mappings: vec![
                mapping("bgm_main.awb", "bgm_main.acb", 82, 0),
                mapping("bgm_main_Cnk_00.awb", "bgm_main.acb", 38, 1),
                mapping("bgm_DLC_01.awb", "bgm_DLC_01.acb", 6, 0),
            ],
            ..Tables::default()
        };

        assert_eq!(tables.index_start("bgm_main.awb"), Some(0));
        assert_eq!(tables.index_start("BGM_MAIN_CNK_00.awb"), Some(82));
        assert_eq!(tables.index_start("bgm_DLC_01.awb"), Some(120));
        assert_eq!(tables.index_start("bgm_DLC_02.awb"), None);

        let tail = tables.tail_port("bgm_main.uasset").unwrap();
        assert_eq!(tail.awb_name, "bgm_main_Cnk_00.awb");
        let ports = tables.ports_for_acb("bgm_main.acb");
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 0);
    }

    #[test]
    fn load_reads_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DICTIONARY_FILE),
            "CueName,TargetFile,Index\nTitle, bgm_main.awb ,12\nBattle,bgm_main_Cnk_00.awb,90\n",
        )
        .unwrap();
        fs::write(
            dir.path().join(MAPPING_FILE),
            "AwbName,AcbName,Tracks,Port\n\
             bgm_main.awb,bgm_main.acb,82,0\n\
             bgm_main_Cnk_00.awb,bgm_main.acb,38,1\n",
        )
        .unwrap();
        fs::write(dir.path().join(PAIRS_FILE), "Index1,Index2\n12,13\n").unwrap();
        fs::write(dir.path().join(BANNED_FILE), "Index1,Index2\n0,5\n82,-1\n").unwrap();

        let tables = Tables::load(dir.path()).unwrap();
        assert_eq!(tables.dictionary.len(), 2);
        assert_eq!(tables.dictionary[0].target_file, "bgm_main.awb");
        assert_eq!(tables.mappings[1].tracks, 38);
        assert_eq!(tables.pairs, vec![PairRule(12, 13)]);
        assert_eq!(
            tables.bans,
            vec![BanRule::Range { lo: 0, hi: 5 }, BanRule::Single(82)]
        );
        assert!(tables.is_banned(3));
        assert!(tables.is_banned(82));
        assert!(!tables.is_banned(83));
        assert_eq!(tables.partners(13).collect::<Vec<_>>(), vec![12]);
    }

    #[test]
    fn empty_ban_table_is_allowed() {
        let rows: Vec<BanRow> = parse_table("".as_bytes()).unwrap();
        assert!(rows.is_empty());
    }
}
