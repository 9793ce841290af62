use std::env;
use std::path::{Path, PathBuf};

use crate::cache::{sidecar_path, CacheKind};
use crate::editor::EditorOptions;
use crate::offsets::{OffsetUpdate, TableStrategy};

/// Settings for one invocation, passed explicitly to every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Directory holding the CSV lookup tables.
    pub data_dir: PathBuf,
    /// Directory holding the segment index sidecars.
    pub cache_dir: PathBuf,
    pub editor: EditorOptions,
    pub table_strategy: TableStrategy,
    pub offset_update: OffsetUpdate,
    /// Dump segments next to each scanned container.
    pub extract: bool,
}

impl RunContext {
    pub fn new(data_dir: Option<PathBuf>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.unwrap_or_else(default_dir),
            cache_dir: cache_dir.unwrap_or_else(default_dir),
            editor: EditorOptions::default(),
            table_strategy: TableStrategy::default(),
            offset_update: OffsetUpdate::default(),
            extract: false,
        }
    }

    pub fn cache_path(&self, container: &Path, kind: CacheKind) -> PathBuf {
        sidecar_path(&self.cache_dir, container, kind)
    }
}

pub fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.to_path_buf()))
}

fn default_dir() -> PathBuf {
    exe_dir()
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directories_win() {
        let ctx = RunContext::new(Some("data".into()), Some("cache".into()));
        assert_eq!(ctx.data_dir, PathBuf::from("data"));
        assert_eq!(
            ctx.cache_path(Path::new("music/bgm_main.awb"), CacheKind::Awb),
            Path::new("cache").join("bgm_main_headers.csv")
        );
        assert_eq!(ctx.table_strategy, TableStrategy::Ported);
        assert!(ctx.editor.padding);
    }

    #[test]
    fn defaults_to_the_executable_directory() {
        let ctx = RunContext::new(None, None);
        assert_eq!(Some(ctx.data_dir), exe_dir());
    }
}
