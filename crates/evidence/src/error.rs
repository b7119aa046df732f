//! Error taxonomy for the evidence engine.

use std::path::PathBuf;

use drawchat_pdf_engine::RasterError;

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    /// Source PDF or source raster missing at the point of use.
    #[error("source file not found: {0}")]
    SourceNotFound(PathBuf),

    /// Requested page index exceeds the document's page count.
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },

    /// A full-page render failed inside the ROI orchestrator. Fatal for
    /// that ROI; there is no fallback for render failure.
    #[error("failed to render page for block {block_id}: {source}")]
    RenderFailed {
        block_id: String,
        #[source]
        source: Box<EvidenceError>,
    },

    #[error("raster backend error: {0}")]
    Raster(#[from] RasterError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
