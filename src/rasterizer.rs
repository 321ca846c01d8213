use crate::error::CoreError;
use crate::provider::PageImage;

/// Splits a PDF into per-page images for the vision providers. The actual
/// rasterisation backend (a PDF renderer) is out of scope for this core;
/// this trait is the seam a concrete implementation plugs into.
pub trait Rasterizer: Send + Sync {
    fn rasterize(&self, pdf_bytes: &[u8]) -> Result<Vec<PageImage>, CoreError>;
}

/// Placeholder used where no rasterisation backend is configured. Always
/// fails -- a misconfigured deployment should surface loudly rather than
/// silently skip OCR for every index document.
pub struct UnconfiguredRasterizer;

impl Rasterizer for UnconfiguredRasterizer {
    fn rasterize(&self, _pdf_bytes: &[u8]) -> Result<Vec<PageImage>, CoreError> {
        Err(CoreError::Storage("no rasterizer backend configured".to_string()))
    }
}
