//! Page rasterization backend for the evidence engine.
//!
//! Exposes the [`PageRasterizer`] trait: open a source PDF by path and
//! produce an RGB raster of one page at a requested DPI. The default
//! [`LopdfRasterizer`] backend is pure Rust — it reads page geometry from
//! the PDF (MediaBox) and emits a correctly sized placeholder raster. Real
//! content rendering is available behind the `pdfium` feature via
//! [`pdfium_backend::PdfiumRasterizer`].
//!
//! The backend is stateless and path-driven: the evidence layer caches
//! rendered rasters on disk, so there is no document handle registry here.

use std::fs;
use std::path::Path;

use image::{ImageBuffer, Rgb};
use lopdf::Document;

/// RGB raster of one rendered page.
pub type PageRaster = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// PDF user-space default resolution. A render at this DPI maps one PDF
/// point to one pixel.
pub const BASE_DPI: u32 = 72;

/// Page dimensions in PDF points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSizePt {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSizePt {
    /// US Letter, the fallback when a page carries no usable MediaBox.
    pub const LETTER: PageSizePt = PageSizePt { width_pt: 612.0, height_pt: 792.0 };

    /// Pixel dimensions of this page rendered at `dpi`.
    pub fn pixel_dims(&self, dpi: u32) -> (u32, u32) {
        let zoom = dpi as f32 / BASE_DPI as f32;
        let width = (self.width_pt * zoom).round().max(1.0) as u32;
        let height = (self.height_pt * zoom).round().max(1.0) as u32;
        (width, height)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("backend error: {0}")]
    Backend(String),
}

/// A backend that can rasterize single pages of a PDF source file.
///
/// Implementations must be stateless with respect to the source: every call
/// opens the file at `source` fresh. `page` is zero-indexed.
pub trait PageRasterizer {
    fn page_count(&self, source: &Path) -> Result<u32, RasterError>;
    fn page_size(&self, source: &Path, page: u32) -> Result<PageSizePt, RasterError>;
    fn rasterize(&self, source: &Path, page: u32, dpi: u32) -> Result<PageRaster, RasterError>;
}

/// Default backend built on `lopdf`.
///
/// Parses real page geometry but does not rasterize page content (lopdf has
/// no rasterizer); the output is a white page with a light border, sized
/// exactly as a content render at the same DPI would be. Enable the
/// `pdfium` feature for content rendering.
#[derive(Debug, Default)]
pub struct LopdfRasterizer;

impl LopdfRasterizer {
    pub fn new() -> Self {
        Self
    }

    fn parse_sizes(bytes: &[u8]) -> Result<Vec<PageSizePt>, RasterError> {
        if bytes.windows("/Encrypt".len()).any(|window| window == b"/Encrypt") {
            return Err(RasterError::EncryptedUnsupported);
        }

        let doc = Document::load_mem(bytes)?;
        let pages = doc.get_pages();
        let mut sizes = Vec::with_capacity(pages.len());

        for (_, object_id) in pages {
            let dict = doc.get_dictionary(object_id)?;
            let size = dict
                .get(b"MediaBox")
                .ok()
                .and_then(|obj| obj.as_array().ok())
                .and_then(|array| {
                    if array.len() != 4 {
                        return None;
                    }
                    let x0 = array[0].as_float().ok()?;
                    let y0 = array[1].as_float().ok()?;
                    let x1 = array[2].as_float().ok()?;
                    let y1 = array[3].as_float().ok()?;
                    Some(PageSizePt { width_pt: (x1 - x0).abs(), height_pt: (y1 - y0).abs() })
                })
                .unwrap_or(PageSizePt::LETTER);

            sizes.push(size);
        }

        if sizes.is_empty() {
            return Err(RasterError::Backend("document has no pages".to_owned()));
        }

        Ok(sizes)
    }

    fn sizes_for(&self, source: &Path) -> Result<Vec<PageSizePt>, RasterError> {
        let bytes = fs::read(source)?;
        Self::parse_sizes(&bytes)
    }

    fn size_at(sizes: &[PageSizePt], page: u32) -> Result<PageSizePt, RasterError> {
        sizes.get(page as usize).copied().ok_or(RasterError::PageOutOfRange {
            page,
            page_count: sizes.len() as u32,
        })
    }
}

impl PageRasterizer for LopdfRasterizer {
    fn page_count(&self, source: &Path) -> Result<u32, RasterError> {
        Ok(self.sizes_for(source)?.len() as u32)
    }

    fn page_size(&self, source: &Path, page: u32) -> Result<PageSizePt, RasterError> {
        Self::size_at(&self.sizes_for(source)?, page)
    }

    fn rasterize(&self, source: &Path, page: u32, dpi: u32) -> Result<PageRaster, RasterError> {
        let size = Self::size_at(&self.sizes_for(source)?, page)?;
        let (width, height) = size.pixel_dims(dpi);

        let mut image = PageRaster::from_pixel(width, height, Rgb([255, 255, 255]));

        if width >= 4 && height >= 4 {
            for x in 0..width {
                image.put_pixel(x, 0, Rgb([220, 220, 220]));
                image.put_pixel(x, height - 1, Rgb([220, 220, 220]));
            }
            for y in 0..height {
                image.put_pixel(0, y, Rgb([220, 220, 220]));
                image.put_pixel(width - 1, y, Rgb([220, 220, 220]));
            }
        }

        Ok(image)
    }
}

#[cfg(feature = "pdfium")]
pub mod pdfium_backend {
    use super::*;
    use pdfium_render::prelude::*;

    /// Content-rendering backend bound to the system pdfium library.
    pub struct PdfiumRasterizer {
        pdfium: Pdfium,
    }

    impl PdfiumRasterizer {
        pub fn from_system_library() -> Result<Self, RasterError> {
            let bindings = Pdfium::bind_to_system_library().map_err(|err| {
                RasterError::Backend(format!("failed to bind pdfium system library: {err}"))
            })?;

            Ok(Self { pdfium: Pdfium::new(bindings) })
        }

        fn load(&self, source: &Path) -> Result<PdfDocument<'_>, RasterError> {
            self.pdfium
                .load_pdf_from_file(source, None)
                .map_err(|err| RasterError::Backend(format!("pdfium load failed: {err}")))
        }
    }

    impl PageRasterizer for PdfiumRasterizer {
        fn page_count(&self, source: &Path) -> Result<u32, RasterError> {
            Ok(self.load(source)?.pages().len() as u32)
        }

        fn page_size(&self, source: &Path, page: u32) -> Result<PageSizePt, RasterError> {
            let document = self.load(source)?;
            let page_count = document.pages().len() as u32;
            let pdf_page = document
                .pages()
                .get(page as u16)
                .map_err(|_| RasterError::PageOutOfRange { page, page_count })?;

            Ok(PageSizePt {
                width_pt: pdf_page.width().value,
                height_pt: pdf_page.height().value,
            })
        }

        fn rasterize(&self, source: &Path, page: u32, dpi: u32) -> Result<PageRaster, RasterError> {
            let document = self.load(source)?;
            let page_count = document.pages().len() as u32;
            let pdf_page = document
                .pages()
                .get(page as u16)
                .map_err(|_| RasterError::PageOutOfRange { page, page_count })?;

            let size = PageSizePt {
                width_pt: pdf_page.width().value,
                height_pt: pdf_page.height().value,
            };
            let (width, height) = size.pixel_dims(dpi);

            let bitmap = pdf_page
                .render_with_config(
                    &PdfRenderConfig::new()
                        .set_target_width(width as i32)
                        .set_maximum_height(height as i32),
                )
                .map_err(|err| RasterError::Backend(format!("pdfium render failed: {err}")))?;

            Ok(bitmap.as_image().to_rgb8())
        }
    }
}
