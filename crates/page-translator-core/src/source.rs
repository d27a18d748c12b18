//! Page rendering boundary.
//!
//! Rasterizing or extracting a page is done elsewhere; the scheduler only
//! asks a [`PageSource`] for the input of a page and hands it to the
//! translator.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::model::{PageNumber, PageReplacement, Rotation};

/// What the AI service receives for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageInput {
    /// Extracted page text
    Text(String),
    /// Rendered page image
    Image { bytes: Bytes, mime: String },
}

impl PageInput {
    pub fn image(bytes: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        Self::Image {
            bytes: bytes.into(),
            mime: mime.into(),
        }
    }

    pub const fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }
}

/// Produces translator input for a page.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Number of pages in the source document
    fn page_count(&self) -> u32;

    /// Render or extract a page, honoring its rotation and replacement source.
    async fn page_input(
        &self,
        page: PageNumber,
        rotation: Rotation,
        replacement: Option<&PageReplacement>,
    ) -> Result<PageInput>;
}
