//! The evidence manager: renders PDF pages to cached PNGs, crops regions
//! of interest, and keeps both cache tiers within the configured budget.
//!
//! Cache layout on disk:
//!
//! ```text
//! <cache_dir>/renders/{block_id}_p{page}_d{dpi}_v{mtime_hash:08x}.png
//! <cache_dir>/crops/{block_id}_p{page}_d{dpi}_crop_{x0}_{y0}_{x1}_{y1}.png
//! ```
//!
//! The render filename carries an 8-hex-char hash of the source PDF's
//! modification time, so a changed PDF produces a new cache key and old
//! renders simply stop being looked up. Stale versions are reclaimed by
//! [`EvidenceManager::cleanup_old_versions`].

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use drawchat_pdf_engine::{LopdfRasterizer, PageRasterizer, RasterError};

use crate::config::EvidenceConfig;
use crate::error::EvidenceError;
use crate::lru::{CacheEntry, EvictionController, Tier};
use crate::roi::{BBoxNorm, RenderedEvidence, RequestedRoi};

/// DPI is clamped into this range rather than rejected; callers pass DPI
/// straight from user-controlled ROI requests.
const MIN_DPI: u32 = 72;
const MAX_DPI: u32 = 600;

/// Manages rendering of PDF pages and cropping regions of interest.
///
/// Safe to share across threads: the cache index lives behind a mutex, and
/// rasterization and image decode run outside the lock.
pub struct EvidenceManager {
    config: EvidenceConfig,
    renders_dir: PathBuf,
    crops_dir: PathBuf,
    rasterizer: Box<dyn PageRasterizer + Send + Sync>,
    state: Mutex<EvictionController>,
}

impl EvidenceManager {
    /// Creates a manager with the default `lopdf` rasterization backend,
    /// creating the cache directories and adopting any cache files that
    /// survive from a prior run.
    pub fn new(config: EvidenceConfig) -> io::Result<Self> {
        Self::with_rasterizer(config, Box::new(LopdfRasterizer::new()))
    }

    /// Creates a manager with a custom rasterization backend.
    pub fn with_rasterizer(
        config: EvidenceConfig,
        rasterizer: Box<dyn PageRasterizer + Send + Sync>,
    ) -> io::Result<Self> {
        let renders_dir = config.renders_dir();
        let crops_dir = config.crops_dir();
        fs::create_dir_all(&renders_dir)?;
        fs::create_dir_all(&crops_dir)?;

        let mut controller = EvictionController::new(config.max_cache_bytes);
        load_existing_cache(&mut controller, &renders_dir, Tier::Render);
        load_existing_cache(&mut controller, &crops_dir, Tier::Crop);

        Ok(Self { config, renders_dir, crops_dir, rasterizer, state: Mutex::new(controller) })
    }

    /// Renders a PDF page to a cached PNG. `page` is zero-indexed; `dpi`
    /// is clamped into [72, 600].
    ///
    /// Calling twice with identical inputs and an unchanged source file
    /// returns the same path without re-rendering.
    pub fn render_page(
        &self,
        source_path: &Path,
        block_id: &str,
        page: u32,
        dpi: u32,
    ) -> Result<PathBuf, EvidenceError> {
        if !source_path.exists() {
            return Err(EvidenceError::SourceNotFound(source_path.to_path_buf()));
        }

        let dpi = dpi.clamp(MIN_DPI, MAX_DPI);
        let mtime_ms = source_mtime_ms(source_path);
        let stem = render_stem(block_id, page, dpi, mtime_ms);
        let png_path = self.renders_dir.join(format!("{stem}.png"));

        {
            let mut state = self.state.lock().unwrap();
            if state.renders.contains(&stem) {
                if png_path.exists() {
                    state.renders.touch(&stem);
                    return Ok(png_path);
                }
                // The file vanished externally; drop the stale entry and
                // fall through to re-render.
                state.remove(Tier::Render, &stem);
            } else if png_path.exists() {
                // Surviving file from a prior run not seen by the startup
                // scan: adopt it without re-rendering.
                let entry = entry_for_file(&png_path, mtime_ms)?;
                tracing::debug!(%stem, "adopted on-disk render");
                state.insert(Tier::Render, stem, entry);
                return Ok(png_path);
            }
        }

        let raster = self.rasterizer.rasterize(source_path, page, dpi).map_err(|err| match err {
            RasterError::PageOutOfRange { page, page_count } => {
                EvidenceError::PageOutOfRange { page, page_count }
            }
            other => EvidenceError::Raster(other),
        })?;

        // Estimate as raw RGB; the authoritative entry size is taken from
        // file metadata once the write completes.
        let estimated = raster.width() as u64 * raster.height() as u64 * 3;

        let mut state = self.state.lock().unwrap();
        state.reserve(estimated);
        raster.save(&png_path)?;
        let entry = entry_for_file(&png_path, mtime_ms)?;
        state.insert(Tier::Render, stem, entry);

        Ok(png_path)
    }

    /// Crops a region from a full-page raster using normalized
    /// coordinates. The bounding box is corrected (clamped, inverted axes
    /// replaced with the full extent) before use.
    pub fn crop_png(
        &self,
        png_path: &Path,
        bbox_norm: &BBoxNorm,
        block_id: &str,
        page: u32,
        dpi: u32,
    ) -> Result<PathBuf, EvidenceError> {
        if !png_path.exists() {
            return Err(EvidenceError::SourceNotFound(png_path.to_path_buf()));
        }

        let corrected = bbox_norm.corrected();
        let stem = crop_stem(block_id, page, dpi, &corrected);
        let crop_path = self.crops_dir.join(format!("{stem}.png"));

        {
            let mut state = self.state.lock().unwrap();
            if state.crops.contains(&stem) {
                if crop_path.exists() {
                    state.crops.touch(&stem);
                    return Ok(crop_path);
                }
                state.remove(Tier::Crop, &stem);
            } else if crop_path.exists() {
                let entry = entry_for_file(&crop_path, 0)?;
                tracing::debug!(%stem, "adopted on-disk crop");
                state.insert(Tier::Crop, stem, entry);
                return Ok(crop_path);
            }
        }

        let full_page = image::open(png_path)?.to_rgb8();
        let rect = corrected.to_pixels(full_page.width(), full_page.height());
        let cropped =
            image::imageops::crop_imm(&full_page, rect.left, rect.top, rect.width(), rect.height())
                .to_image();

        let mut state = self.state.lock().unwrap();
        state.reserve(rect.estimated_rgb_bytes());
        cropped.save(&crop_path)?;
        let entry = entry_for_file(&crop_path, 0)?;
        state.insert(Tier::Crop, stem, entry);

        Ok(crop_path)
    }

    /// Renders the page an ROI refers to, then crops the requested region.
    ///
    /// `roi.page` is 1-indexed and converted here. A render failure is
    /// fatal for the ROI; a crop failure is recoverable: with
    /// `fallback_to_full_page` the full-page path is substituted and
    /// `is_fallback` is set, otherwise the crop error propagates.
    pub fn render_and_crop_roi(
        &self,
        roi: &RequestedRoi,
        source_path: &Path,
        fallback_to_full_page: bool,
    ) -> Result<RenderedEvidence, EvidenceError> {
        // ROI pages are 1-indexed at the planner boundary.
        let page = roi.page.saturating_sub(1);

        let png_path = self
            .render_page(source_path, &roi.block_id, page, roi.dpi)
            .map_err(|err| EvidenceError::RenderFailed {
                block_id: roi.block_id.clone(),
                source: Box::new(err),
            })?;

        let (crop_path, is_fallback) =
            match self.crop_png(&png_path, &roi.bbox_norm, &roi.block_id, page, roi.dpi) {
                Ok(path) => (path, false),
                Err(err) if fallback_to_full_page => {
                    tracing::warn!(block_id = %roi.block_id, %err, "crop failed, using full page");
                    (png_path.clone(), true)
                }
                Err(err) => return Err(err),
            };

        Ok(RenderedEvidence {
            block_id: roi.block_id.clone(),
            page,
            dpi: roi.dpi,
            png_path,
            is_crop: true,
            bbox_norm: roi.bbox_norm,
            crop_path,
            is_fallback,
        })
    }

    /// Gathers evidence images for a batch of ROIs.
    ///
    /// One bad region never aborts the batch: an ROI whose block id has no
    /// known source path, or whose rendering fails, is recorded as a
    /// warning and skipped. Output order follows input order; duplicate
    /// paths are suppressed on first occurrence. With `include_full_page`
    /// the full-page render precedes the corresponding crop.
    pub fn gather_evidence_for_rois(
        &self,
        rois: &[RequestedRoi],
        block_paths: &HashMap<String, PathBuf>,
        include_full_page: bool,
    ) -> (Vec<PathBuf>, Vec<String>) {
        let mut evidence_paths: Vec<PathBuf> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for roi in rois {
            let Some(source_path) = block_paths.get(&roi.block_id) else {
                warnings.push(format!("Block {} not found in available paths", roi.block_id));
                continue;
            };

            match self.render_and_crop_roi(roi, source_path, true) {
                Ok(evidence) => {
                    if include_full_page && seen.insert(evidence.png_path.clone()) {
                        evidence_paths.push(evidence.png_path.clone());
                    }
                    if seen.insert(evidence.crop_path.clone()) {
                        evidence_paths.push(evidence.crop_path.clone());
                    }
                    if evidence.is_fallback {
                        warnings.push(format!(
                            "Block {}: crop failed, using full page",
                            roi.block_id
                        ));
                    }
                }
                Err(err) => {
                    tracing::warn!(block_id = %roi.block_id, %err, "failed to render ROI");
                    warnings.push(format!(
                        "Failed to render ROI for block {}: {err}",
                        roi.block_id
                    ));
                }
            }
        }

        (evidence_paths, warnings)
    }

    /// Deletes every cached raster in both tiers and empties the in-memory
    /// index. Best-effort: individual deletion failures are reported, not
    /// raised.
    pub fn clear_cache(&self) -> MaintenanceReport {
        let mut state = self.state.lock().unwrap();
        let mut report = MaintenanceReport::default();

        for dir in [&self.renders_dir, &self.crops_dir] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    report.failures.push((dir.clone(), err));
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("png") {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => report.deleted += 1,
                    Err(err) => report.failures.push((path, err)),
                }
            }
        }

        state.clear();
        report
    }

    /// Removes stale full-page renders left behind by source PDF changes.
    ///
    /// Groups render files by their base key (filename with the version
    /// suffix stripped) and keeps only the most recently modified file of
    /// each group. The automatic key scheme never deletes an old version
    /// on its own — the old key simply stops being looked up — so this is
    /// the mechanism that reclaims that space.
    pub fn cleanup_old_versions(&self) -> MaintenanceReport {
        let mut state = self.state.lock().unwrap();
        let mut report = MaintenanceReport::default();

        let mut groups: HashMap<String, Vec<(PathBuf, SystemTime)>> = HashMap::new();
        if let Ok(entries) = fs::read_dir(&self.renders_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("png") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let Some((base, _version)) = stem.rsplit_once("_v") else {
                    continue;
                };
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(UNIX_EPOCH);
                groups.entry(base.to_string()).or_default().push((path, modified));
            }
        }

        for (_base, mut files) in groups {
            if files.len() <= 1 {
                continue;
            }
            files.sort_by_key(|(_, modified)| *modified);
            files.pop(); // newest survives

            for (path, _) in files {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                match fs::remove_file(&path) {
                    Ok(()) => {
                        report.deleted += 1;
                        state.remove(Tier::Render, &stem);
                    }
                    Err(err) => report.failures.push((path, err)),
                }
            }
        }

        report
    }

    /// Reports cache statistics from a fresh disk scan, independent of the
    /// in-memory index. A stat failure on an individual file counts it as
    /// absent.
    pub fn cache_stats(&self) -> CacheStats {
        let (renders_count, renders_bytes) = scan_dir(&self.renders_dir);
        let (crops_count, crops_bytes) = scan_dir(&self.crops_dir);
        let total_bytes = renders_bytes + crops_bytes;
        let max_bytes = self.config.max_cache_bytes;

        let usage_percent = if max_bytes == 0 {
            0.0
        } else {
            round1(100.0 * total_bytes as f64 / max_bytes as f64)
        };

        let state = self.state.lock().unwrap();
        CacheStats {
            renders_count,
            renders_size_mb: to_mb(renders_bytes),
            crops_count,
            crops_size_mb: to_mb(crops_bytes),
            total_size_mb: to_mb(total_bytes),
            max_size_mb: max_bytes as f64 / (1024.0 * 1024.0),
            usage_percent,
            memory_render_entries: state.renders.len(),
            memory_crop_entries: state.crops.len(),
        }
    }

    /// Total bytes currently tracked by the eviction controller.
    pub fn tracked_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes()
    }

    pub fn config(&self) -> &EvidenceConfig {
        &self.config
    }
}

/// Cache statistics from a disk rescan plus in-memory index counts.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub renders_count: usize,
    pub renders_size_mb: f64,
    pub crops_count: usize,
    pub crops_size_mb: f64,
    pub total_size_mb: f64,
    pub max_size_mb: f64,
    pub usage_percent: f64,
    pub memory_render_entries: usize,
    pub memory_crop_entries: usize,
}

/// Outcome of a best-effort maintenance pass. Individual failures are
/// accumulated so operators can observe them without the pass aborting.
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub deleted: usize,
    pub failures: Vec<(PathBuf, io::Error)>,
}

fn source_mtime_ms(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn mtime_hash(mtime_ms: u64) -> u32 {
    let mut hasher = DefaultHasher::new();
    mtime_ms.hash(&mut hasher);
    hasher.finish() as u32
}

fn render_stem(block_id: &str, page: u32, dpi: u32, mtime_ms: u64) -> String {
    format!("{block_id}_p{page}_d{dpi}_v{:08x}", mtime_hash(mtime_ms))
}

fn crop_stem(block_id: &str, page: u32, dpi: u32, bbox: &BBoxNorm) -> String {
    format!(
        "{block_id}_p{page}_d{dpi}_crop_{:.4}_{:.4}_{:.4}_{:.4}",
        bbox.x0, bbox.y0, bbox.x1, bbox.y1
    )
}

fn entry_for_file(path: &Path, source_mtime_ms: u64) -> io::Result<CacheEntry> {
    let metadata = fs::metadata(path)?;
    let now = SystemTime::now();
    Ok(CacheEntry {
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        created_at: metadata.created().unwrap_or(now),
        source_mtime_ms,
        last_accessed: now,
    })
}

/// Adopts cache files surviving from a prior process run. The source
/// mtime is unknown for recovered entries and recorded as 0.
fn load_existing_cache(controller: &mut EvictionController, dir: &Path, tier: Tier) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("png") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let now = SystemTime::now();
        let cache_entry = CacheEntry {
            path: path.clone(),
            size_bytes: metadata.len(),
            created_at: metadata.created().unwrap_or(now),
            source_mtime_ms: 0,
            last_accessed: metadata.accessed().or_else(|_| metadata.modified()).unwrap_or(now),
        };
        controller.insert(tier, stem.to_string(), cache_entry);
    }
}

fn scan_dir(dir: &Path) -> (usize, u64) {
    let mut count = 0;
    let mut bytes = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("png") {
                continue;
            }
            // Tolerate a file disappearing mid-scan.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            count += 1;
            bytes += metadata.len();
        }
    }
    (count, bytes)
}

fn to_mb(bytes: u64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sample_pdf_bytes(page_count: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<Object> = Vec::with_capacity(page_count);

        for _ in 0..page_count {
            let content = Content {
                operations: vec![
                    Operation::new("re", vec![72.into(), 72.into(), 100.into(), 100.into()]),
                    Operation::new("f", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    fn write_pdf(dir: &Path, name: &str, page_count: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, sample_pdf_bytes(page_count)).unwrap();
        path
    }

    /// Rasterizer wrapper counting rasterize calls, to assert cache hits
    /// perform no re-render.
    struct CountingRasterizer {
        inner: LopdfRasterizer,
        calls: Arc<AtomicUsize>,
    }

    impl PageRasterizer for CountingRasterizer {
        fn page_count(&self, source: &Path) -> Result<u32, RasterError> {
            self.inner.page_count(source)
        }

        fn page_size(
            &self,
            source: &Path,
            page: u32,
        ) -> Result<drawchat_pdf_engine::PageSizePt, RasterError> {
            self.inner.page_size(source, page)
        }

        fn rasterize(
            &self,
            source: &Path,
            page: u32,
            dpi: u32,
        ) -> Result<drawchat_pdf_engine::PageRaster, RasterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.rasterize(source, page, dpi)
        }
    }

    fn counting_manager(cache_dir: &Path) -> (EvidenceManager, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let rasterizer = CountingRasterizer { inner: LopdfRasterizer::new(), calls: calls.clone() };
        let config = EvidenceConfig::default().with_cache_dir(cache_dir);
        let manager = EvidenceManager::with_rasterizer(config, Box::new(rasterizer)).unwrap();
        (manager, calls)
    }

    fn manager(cache_dir: &Path) -> EvidenceManager {
        EvidenceManager::new(EvidenceConfig::default().with_cache_dir(cache_dir)).unwrap()
    }

    fn roi(block_id: &str, page: u32, bbox: BBoxNorm, dpi: u32) -> RequestedRoi {
        RequestedRoi {
            block_id: block_id.to_string(),
            page,
            bbox_norm: bbox,
            dpi,
            reason: String::new(),
        }
    }

    #[test]
    fn render_page_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let (manager, calls) = counting_manager(&dir.path().join("cache"));

        let first = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();
        let second = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();

        assert_eq!(first, second);
        assert!(first.exists());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn render_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir.path().join("cache"));

        let err = manager
            .render_page(Path::new("/nonexistent/drawing.pdf"), "BLK-A", 0, 150)
            .unwrap_err();
        assert!(matches!(err, EvidenceError::SourceNotFound(_)));
    }

    #[test]
    fn render_page_out_of_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 2);
        let manager = manager(&dir.path().join("cache"));

        let err = manager.render_page(&pdf, "BLK-A", 9, 150).unwrap_err();
        assert!(matches!(err, EvidenceError::PageOutOfRange { page: 9, page_count: 2 }));
    }

    #[test]
    fn dpi_is_clamped_not_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        let low = manager.render_page(&pdf, "BLK-A", 0, 10).unwrap();
        assert!(low.to_str().unwrap().contains("_d72_"));

        let high = manager.render_page(&pdf, "BLK-A", 0, 9999).unwrap();
        assert!(high.to_str().unwrap().contains("_d600_"));
    }

    #[test]
    fn changed_source_yields_new_cache_path() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        let first = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();

        // Rewrite the source so its mtime changes.
        thread::sleep(Duration::from_millis(50));
        fs::write(&pdf, sample_pdf_bytes(1)).unwrap();

        let second = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();

        assert_ne!(first, second);
        // Both versions coexist until cleanup.
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn crop_produces_expected_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        // 612x792 pt page at 72 DPI renders 612x792 px.
        let page = manager.render_page(&pdf, "BLK-A", 0, 72).unwrap();
        let bbox = BBoxNorm::new(0.25, 0.25, 0.75, 0.75);
        let crop = manager.crop_png(&page, &bbox, "BLK-A", 0, 72).unwrap();

        let img = image::open(&crop).unwrap();
        assert_eq!(img.width(), 306);
        assert_eq!(img.height(), 396);
    }

    #[test]
    fn crop_is_cached_by_corrected_bbox() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        let page = manager.render_page(&pdf, "BLK-A", 0, 72).unwrap();
        let inverted = BBoxNorm::new(0.6, 0.1, 0.2, 0.9);
        let full_width = BBoxNorm::new(0.0, 0.1, 1.0, 0.9);

        // Inverted x corrects to full width, so both boxes share one key.
        let first = manager.crop_png(&page, &inverted, "BLK-A", 0, 72).unwrap();
        let second = manager.crop_png(&page, &full_width, "BLK-A", 0, 72).unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.cache_stats().crops_count, 1);
    }

    #[test]
    fn crop_missing_raster_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir.path().join("cache"));
        let bbox = BBoxNorm::new(0.1, 0.1, 0.9, 0.9);

        let err = manager
            .crop_png(Path::new("/nonexistent/page.png"), &bbox, "BLK-A", 0, 72)
            .unwrap_err();
        assert!(matches!(err, EvidenceError::SourceNotFound(_)));
    }

    #[test]
    fn eviction_keeps_cache_near_budget() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 3);
        let config = EvidenceConfig {
            cache_dir: dir.path().join("cache"),
            max_cache_bytes: 1024,
        };
        let manager = EvidenceManager::new(config).unwrap();

        let first = manager.render_page(&pdf, "BLK-A", 0, 72).unwrap();
        let second = manager.render_page(&pdf, "BLK-A", 1, 72).unwrap();
        let third = manager.render_page(&pdf, "BLK-A", 2, 72).unwrap();

        // Each reservation exceeds the budget, so prior renders are gone.
        assert!(!first.exists());
        assert!(!second.exists());
        assert!(third.exists());

        let stats = manager.cache_stats();
        assert_eq!(stats.renders_count, 1);
        assert_eq!(stats.memory_render_entries, 1);

        // Only the overshoot of the single pending write remains tracked.
        let third_size = fs::metadata(&third).unwrap().len();
        assert_eq!(manager.tracked_bytes(), third_size);
    }

    #[test]
    fn crop_failure_falls_back_to_full_page() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        let request = roi("BLK-A", 1, BBoxNorm::new(0.1, 0.1, 0.9, 0.9), 150);

        // Corrupt the cached full-page render so decoding it for the crop
        // fails while the render cache hit still succeeds.
        let page = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();
        fs::write(&page, b"not a png").unwrap();

        let evidence = manager.render_and_crop_roi(&request, &pdf, true).unwrap();
        assert!(evidence.is_fallback);
        assert_eq!(evidence.crop_path, evidence.png_path);
        assert_eq!(evidence.page, 0);

        let err = manager.render_and_crop_roi(&request, &pdf, false).unwrap_err();
        assert!(matches!(err, EvidenceError::Image(_)));
    }

    #[test]
    fn render_failure_is_fatal_for_the_roi() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        // Page 5 of a 1-page document.
        let request = roi("BLK-A", 6, BBoxNorm::new(0.1, 0.1, 0.9, 0.9), 150);

        let err = manager.render_and_crop_roi(&request, &pdf, true).unwrap_err();
        assert!(matches!(err, EvidenceError::RenderFailed { .. }));
    }

    #[test]
    fn batch_continues_past_bad_regions() {
        let dir = tempfile::tempdir().unwrap();
        let pdf_a = write_pdf(dir.path(), "a.pdf", 1);
        let pdf_b = write_pdf(dir.path(), "b.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        // Engineer a crop failure for block B by corrupting its render.
        let page_b = manager.render_page(&pdf_b, "BLK-B", 0, 150).unwrap();
        fs::write(&page_b, b"not a png").unwrap();

        let rois = vec![
            roi("BLK-UNKNOWN", 1, BBoxNorm::new(0.1, 0.1, 0.9, 0.9), 150),
            roi("BLK-B", 1, BBoxNorm::new(0.1, 0.1, 0.9, 0.9), 150),
            roi("BLK-A", 1, BBoxNorm::new(0.1, 0.1, 0.9, 0.9), 150),
        ];
        let block_paths = HashMap::from([
            ("BLK-A".to_string(), pdf_a.clone()),
            ("BLK-B".to_string(), pdf_b.clone()),
        ]);

        let (paths, warnings) = manager.gather_evidence_for_rois(&rois, &block_paths, false);

        // B's fallback full page, then A's crop; two warnings, no abort.
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], page_b);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("BLK-UNKNOWN"));
        assert!(warnings[1].contains("BLK-B"));
        assert!(paths.iter().all(|p| p.exists()));
    }

    #[test]
    fn duplicate_rois_yield_one_evidence_path() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        let bbox = BBoxNorm::new(0.2, 0.2, 0.8, 0.8);
        let rois = vec![roi("BLK-A", 1, bbox, 150), roi("BLK-A", 1, bbox, 150)];
        let block_paths = HashMap::from([("BLK-A".to_string(), pdf)]);

        let (paths, warnings) = manager.gather_evidence_for_rois(&rois, &block_paths, false);

        assert_eq!(paths.len(), 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn full_page_precedes_crop_when_included() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        let rois = vec![roi("BLK-A", 1, BBoxNorm::new(0.2, 0.2, 0.8, 0.8), 150)];
        let block_paths = HashMap::from([("BLK-A".to_string(), pdf)]);

        let (paths, warnings) = manager.gather_evidence_for_rois(&rois, &block_paths, true);

        assert_eq!(paths.len(), 2);
        assert!(paths[0].starts_with(manager.config().renders_dir()));
        assert!(paths[1].starts_with(manager.config().crops_dir()));
        assert!(warnings.is_empty());
    }

    #[test]
    fn cold_start_adopts_existing_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let cache_dir = dir.path().join("cache");

        let first_path = {
            let manager = manager(&cache_dir);
            let page = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();
            let bbox = BBoxNorm::new(0.2, 0.2, 0.8, 0.8);
            manager.crop_png(&page, &bbox, "BLK-A", 0, 150).unwrap();
            page
        };

        let (manager, calls) = counting_manager(&cache_dir);
        let stats = manager.cache_stats();
        assert_eq!(stats.memory_render_entries, 1);
        assert_eq!(stats.memory_crop_entries, 1);
        assert!(manager.tracked_bytes() > 0);

        // The adopted entry satisfies the render without rasterizing.
        let page = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();
        assert_eq!(page, first_path);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_cache_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 2);
        let manager = manager(&dir.path().join("cache"));

        let page = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();
        manager.render_page(&pdf, "BLK-A", 1, 150).unwrap();
        let bbox = BBoxNorm::new(0.2, 0.2, 0.8, 0.8);
        manager.crop_png(&page, &bbox, "BLK-A", 0, 150).unwrap();

        let report = manager.clear_cache();
        assert_eq!(report.deleted, 3);
        assert!(report.failures.is_empty());

        let stats = manager.cache_stats();
        assert_eq!(stats.renders_count, 0);
        assert_eq!(stats.crops_count, 0);
        assert_eq!(stats.memory_render_entries, 0);
        assert_eq!(stats.memory_crop_entries, 0);
        assert_eq!(manager.tracked_bytes(), 0);
    }

    #[test]
    fn cleanup_keeps_only_newest_version() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let manager = manager(&dir.path().join("cache"));

        let old = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();
        thread::sleep(Duration::from_millis(50));
        fs::write(&pdf, sample_pdf_bytes(1)).unwrap();
        let new = manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();
        assert_ne!(old, new);

        let report = manager.cleanup_old_versions();
        assert_eq!(report.deleted, 1);
        assert!(report.failures.is_empty());
        assert!(!old.exists());
        assert!(new.exists());
        assert_eq!(manager.cache_stats().renders_count, 1);
    }

    #[test]
    fn stats_report_budget_and_utilization() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(dir.path(), "a.pdf", 1);
        let config = EvidenceConfig::new(dir.path().join("cache"), 1);
        let manager = EvidenceManager::new(config).unwrap();

        manager.render_page(&pdf, "BLK-A", 0, 150).unwrap();

        let stats = manager.cache_stats();
        assert_eq!(stats.renders_count, 1);
        assert_eq!(stats.max_size_mb, 1.0);
        assert!(stats.usage_percent > 0.0);
        assert_eq!(stats.memory_render_entries, 1);
    }
}
