//! Page input read from a directory of pre-rendered page files.
//!
//! Each file is one page, in file name order: `.txt`/`.md` files are sent as
//! text, image files as images.

use async_trait::async_trait;
use page_translator_core::model::{PageReplacement, Rotation};
use page_translator_core::{Error, PageInput, PageNumber, PageSource, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct DirectoryPageSource {
    files: Vec<PathBuf>,
}

impl DirectoryPageSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let files = list_page_files(dir)?;
        debug!("Found {} page files in {}", files.len(), dir.display());
        Ok(Self { files })
    }

    fn page_file(&self, page: PageNumber) -> Result<&Path> {
        let total = u32::try_from(self.files.len()).unwrap_or(u32::MAX);
        page.checked_sub(1)
            .and_then(|index| self.files.get(index as usize))
            .map(PathBuf::as_path)
            .ok_or(Error::InvalidPage { page, total })
    }
}

#[async_trait]
impl PageSource for DirectoryPageSource {
    fn page_count(&self) -> u32 {
        u32::try_from(self.files.len()).unwrap_or(u32::MAX)
    }

    async fn page_input(
        &self,
        page: PageNumber,
        rotation: Rotation,
        replacement: Option<&PageReplacement>,
    ) -> Result<PageInput> {
        let path = match replacement {
            Some(replacement) => replacement_file(page, replacement)?,
            None => self.page_file(page)?.to_path_buf(),
        };
        if rotation != Rotation::Deg0 {
            // Files are pre-rendered; the model is told nothing about rotation
            debug!("Page {} rotated {} degrees", page, rotation.degrees());
        }
        read_page(page, &path).await
    }
}

fn list_page_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_page_file(path))
        .collect();
    files.sort();
    Ok(files)
}

fn is_page_file(path: &Path) -> bool {
    is_text_file(path) || mime_guess::from_path(path).first().is_some_and(|m| m.type_() == "image")
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt") || ext.eq_ignore_ascii_case("md"))
}

/// A replacement names either a page file or a directory of page files.
fn replacement_file(page: PageNumber, replacement: &PageReplacement) -> Result<PathBuf> {
    let path = PathBuf::from(&replacement.source_file_path);
    if !path.is_dir() {
        return Ok(path);
    }
    let files = list_page_files(&path)?;
    let index = replacement.source_page_number.saturating_sub(1) as usize;
    files.get(index).cloned().ok_or_else(|| Error::PageSource {
        page,
        reason: format!(
            "{} has no page {}",
            path.display(),
            replacement.source_page_number
        ),
    })
}

async fn read_page(page: PageNumber, path: &Path) -> Result<PageInput> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::PageSource {
        page,
        reason: format!("{}: {e}", path.display()),
    })?;

    if is_text_file(path) {
        return Ok(PageInput::Text(String::from_utf8_lossy(&bytes).into_owned()));
    }
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(PageInput::image(bytes, mime.essence_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replacement(path: &Path, page: PageNumber) -> PageReplacement {
        PageReplacement {
            source_file_path: path.display().to_string(),
            source_page_number: page,
            updated_at: std::time::SystemTime::UNIX_EPOCH.into(),
        }
    }

    #[tokio::test]
    async fn test_pages_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("002.txt"), "zweite").unwrap();
        std::fs::write(dir.path().join("001.txt"), "erste").unwrap();
        std::fs::write(dir.path().join("003.png"), [0x89, b'P', b'N', b'G']).unwrap();
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();

        let source = DirectoryPageSource::open(dir.path()).unwrap();
        assert_eq!(source.page_count(), 3);

        let first = source.page_input(1, Rotation::Deg0, None).await.unwrap();
        assert_eq!(first, PageInput::Text("erste".to_string()));

        let third = source.page_input(3, Rotation::Deg90, None).await.unwrap();
        assert!(third.is_image());
        assert!(matches!(third, PageInput::Image { ref mime, .. } if mime == "image/png"));

        assert!(matches!(
            source.page_input(4, Rotation::Deg0, None).await,
            Err(Error::InvalidPage { page: 4, total: 3 })
        ));
    }

    #[tokio::test]
    async fn test_replacement_reads_other_directory() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("001.txt"), "original").unwrap();
        std::fs::write(other.path().join("a.txt"), "scan a").unwrap();
        std::fs::write(other.path().join("b.txt"), "scan b").unwrap();

        let source = DirectoryPageSource::open(dir.path()).unwrap();
        let input = source
            .page_input(1, Rotation::Deg0, Some(&replacement(other.path(), 2)))
            .await
            .unwrap();
        assert_eq!(input, PageInput::Text("scan b".to_string()));

        let missing = source
            .page_input(1, Rotation::Deg0, Some(&replacement(other.path(), 9)))
            .await;
        assert!(matches!(missing, Err(Error::PageSource { page: 1, .. })));
    }
}
