//! Drives a whole injection run: resolve, group, then edit one companion
//! batch at a time.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::cache::{self, CacheKind};
use crate::context::RunContext;
use crate::editor::{ensure_backup, ContainerEditor, EditOutcome, SegmentIndex};
use crate::error::{ConstraintViolation, PatchError, PatchResult, ScanError};
use crate::extract::extract_segments;
use crate::offsets::{locate_table, patch_absolute, patch_delta, OffsetUpdate};
use crate::resolver::{Batch, EditRequest, Resolver};
use crate::scanner::{scan_file, IndexPlan, Segment};
use crate::tables::Tables;
use crate::util::{file_len, file_name_of};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub failed_batches: usize,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.rejected == 0 && self.failed_batches == 0
    }
}

/// Replacement files in `dir`, sorted by path.
pub fn collect_sources(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Read dir: {}", dir.display()))? {
        let path = entry?.path();
        let is_track = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("hca"));
        if is_track && path.is_file() {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}

/// Loads a container's index from its sidecar if every snapshot still
/// matches the file. Otherwise the container is rescanned and the sidecar
/// rewritten.
pub fn load_index(
    container: &Path,
    plan: IndexPlan,
    cache_path: &Path,
) -> PatchResult<SegmentIndex> {
    let file = File::open(container).map_err(|source| ScanError::Open {
        path: container.to_path_buf(),
        source,
    })?;
    let len = file_len(&file).map_err(ScanError::Io)?;

    if let Some(segments) = cache::load(cache_path) {
        let mut reader = BufReader::new(file);
        match cache::matches_container(&mut reader, &segments) {
            Ok(true) => {
                debug!(
                    cache = %cache_path.display(),
                    segments = segments.len(),
                    "Using cached segment index"
                );
                return Ok(SegmentIndex::new(segments, len));
            }
            Ok(false) => warn!(cache = %cache_path.display(), "Segment cache is stale, rescanning"),
            Err(err) => return Err(ScanError::Io(err).into()),
        }
    }

    let segments = scan_file(container, plan)?;
    store_index(cache_path, &segments);
    Ok(SegmentIndex::new(segments, len))
}

fn store_index(cache_path: &Path, segments: &[Segment]) {
    if let Err(err) = cache::save(cache_path, segments) {
        warn!(cache = %cache_path.display(), error = %err, "Could not write segment cache");
    }
}

/// Scans one AWB or companion asset, refreshes its sidecar and, when asked,
/// dumps its segments next to it.
pub fn scan_container(ctx: &RunContext, tables: &Tables, container: &Path) -> Result<usize> {
    let name = file_name_of(container);
    let extension = container
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let (plan, kind) = match extension.as_str() {
        "awb" => (IndexPlan::for_awb(tables, &name), CacheKind::Awb),
        "uasset" | "acb" => (IndexPlan::for_asset(tables, &name), CacheKind::Asset),
        _ => bail!("Unsupported container type: {}", container.display()),
    };

    let segments = scan_file(container, plan)
        .with_context(|| format!("Scan container: {}", container.display()))?;
    let cache_path = ctx.cache_path(container, kind);
    cache::save(&cache_path, &segments)
        .with_context(|| format!("Write cache: {}", cache_path.display()))?;
    info!(container = %container.display(), segments = segments.len(), "Scanned container");

    if ctx.extract {
        let out_dir = container.with_extension("");
        extract_segments(container, &segments, &out_dir)?;
    }
    Ok(segments.len())
}

/// Applies every `.hca` file in `dir` to the containers in its parent
/// directory.
pub fn run_inject(ctx: &RunContext, tables: &Tables, dir: &Path) -> Result<BatchReport> {
    if !dir.is_dir() {
        bail!("Replacement directory not found: {}", dir.display());
    }
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Resolve dir: {}", dir.display()))?;
    let root = dir.parent().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());

    let mut report = BatchReport::default();
    let sources = collect_sources(&dir)?;
    if sources.is_empty() {
        warn!(dir = %dir.display(), "No .hca files to inject");
        return Ok(report);
    }

    let resolver = Resolver::new(tables);
    let resolution = resolver.resolve(&sources, &root);
    let (batches, orphans) = resolver.group_by_companion(resolution.requests, &root);
    for rejection in resolution.rejections.iter().chain(&orphans) {
        warn!(
            source = %rejection.source.display(),
            reason = %rejection.reason,
            "Rejected replacement"
        );
        report.rejected += 1;
    }

    let editor = ContainerEditor::new(ctx.editor);
    for batch in &batches {
        info!(
            companion = %batch.companion.display(),
            requests = batch.requests.len(),
            "Processing batch"
        );
        if let Err(err) = run_batch(ctx, tables, &editor, batch, &mut report) {
            error!(companion = %batch.companion.display(), error = %err, "Batch aborted");
            report.failed_batches += 1;
        }
    }

    info!(
        applied = report.applied,
        skipped = report.skipped,
        rejected = report.rejected,
        failed_batches = report.failed_batches,
        "Injection finished"
    );
    Ok(report)
}

fn run_batch(
    ctx: &RunContext,
    tables: &Tables,
    editor: &ContainerEditor,
    batch: &Batch,
    report: &mut BatchReport,
) -> PatchResult<()> {
    let companion = batch.companion.as_path();
    let plan = IndexPlan::for_asset(tables, &file_name_of(companion));
    let asset_index = load_index(companion, plan, &ctx.cache_path(companion, CacheKind::Asset))?;

    let mut run = BatchRun {
        ctx,
        tables,
        editor,
        companion,
        asset_index,
        awb_indexes: HashMap::new(),
        backed_up: HashSet::new(),
    };
    for request in &batch.requests {
        match run.apply(request) {
            Ok(_) => report.applied += 1,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(
                    index = request.index,
                    source = %request.source.display(),
                    error = %err,
                    "Skipping replacement"
                );
                report.skipped += 1;
            }
        }
    }
    Ok(())
}

struct BatchRun<'a> {
    ctx: &'a RunContext,
    tables: &'a Tables,
    editor: &'a ContainerEditor,
    companion: &'a Path,
    asset_index: SegmentIndex,
    awb_indexes: HashMap<PathBuf, SegmentIndex>,
    backed_up: HashSet<PathBuf>,
}

impl BatchRun<'_> {
    fn apply(&mut self, request: &EditRequest) -> PatchResult<EditOutcome> {
        let mut index = match self.awb_indexes.remove(&request.target) {
            Some(index) => index,
            None => {
                let plan = IndexPlan::for_awb(self.tables, &file_name_of(&request.target));
                let cache_path = self.ctx.cache_path(&request.target, CacheKind::Awb);
                load_index(&request.target, plan, &cache_path)?
            }
        };
        let result = self.apply_to(request, &mut index);
        self.awb_indexes.insert(request.target.clone(), index);
        result
    }

    fn apply_to(
        &mut self,
        request: &EditRequest,
        index: &mut SegmentIndex,
    ) -> PatchResult<EditOutcome> {
        let companion = self.companion;
        if index.find(request.index).is_none() {
            return Err(ConstraintViolation::NoSegment {
                index: request.index,
                container: request.target.clone(),
            }
            .into());
        }
        if self.asset_index.find(request.index).is_none() {
            return Err(ConstraintViolation::NoSegment {
                index: request.index,
                container: companion.to_path_buf(),
            }
            .into());
        }
        self.editor.check_fits(index, request, &request.target)?;

        // A resize rewrites the offset table, so it must be found before any write.
        let slot = if self.editor.size_diff(index, request, &request.target)? != 0 {
            let awb_name = file_name_of(&request.target);
            Some(locate_table(companion, self.ctx.table_strategy, self.tables, &awb_name)?)
        } else {
            None
        };

        self.backup_once(&request.target)?;
        self.backup_once(companion)?;

        self.editor.patch_header_block(
            companion,
            &mut self.asset_index,
            request.index,
            &request.header_block,
        )?;
        store_index(
            &self.ctx.cache_path(companion, CacheKind::Asset),
            &self.asset_index.segments,
        );

        let outcome = self.editor.apply(&request.target, index, request)?;
        store_index(
            &self.ctx.cache_path(&request.target, CacheKind::Awb),
            &index.segments,
        );

        if let Some(slot) = slot {
            let from = u32::try_from(outcome.position).map_err(|_| {
                PatchError::shift(companion, "segment position does not fit the offset table")
            })?;
            match self.ctx.offset_update {
                OffsetUpdate::Absolute => patch_absolute(companion, &slot, index, from)?,
                OffsetUpdate::Delta => patch_delta(companion, &slot, from, outcome.size_diff)?,
            }
        }
        Ok(outcome)
    }

    fn backup_once(&mut self, path: &Path) -> PatchResult<()> {
        if self.backed_up.contains(path) {
            return Ok(());
        }
        ensure_backup(path).map_err(|source| PatchError::Backup {
            path: path.to_path_buf(),
            source,
        })?;
        self.backed_up.insert(path.to_path_buf());
        Ok(())
    }
}
