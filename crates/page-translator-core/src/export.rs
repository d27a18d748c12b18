//! Markdown export of a project's translations.

use std::fmt::Write;

use crate::model::{AnnotationKind, BLANK_PAGE_MARKER, ProjectDocument};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Append each page's doubts and errors as a list
    pub include_annotations: bool,
}

/// Render every page as a `## Page N` section. Untranslated pages are
/// marked rather than skipped so page numbering stays visible.
pub fn export_markdown(doc: &ProjectDocument, options: ExportOptions) -> String {
    let mut out = String::new();
    let title = if doc.file_name.is_empty() {
        doc.file_id.as_str()
    } else {
        doc.file_name.as_str()
    };
    let _ = writeln!(out, "# {title}");

    let last = doc
        .total_pages
        .max(doc.translations.keys().next_back().copied().unwrap_or(0));

    for page in 1..=last {
        let _ = write!(out, "\n## Page {page}\n\n");
        match doc.translations.get(&page).filter(|t| !t.trim().is_empty()) {
            Some(text) if text == BLANK_PAGE_MARKER => out.push_str("*Blank page.*\n"),
            Some(text) => {
                out.push_str(text.trim_end());
                out.push('\n');
            }
            None => out.push_str("*Not translated.*\n"),
        }

        if options.include_annotations
            && let Some(annotations) = doc.annotations.get(&page).filter(|a| !a.is_empty())
        {
            out.push('\n');
            for annotation in annotations {
                let label = match annotation.kind {
                    AnnotationKind::Doubt => "Doubt",
                    AnnotationKind::Error => "Error",
                };
                let _ = write!(out, "> **{label}:** {}", annotation.comment);
                if let Some(original) = &annotation.original {
                    let _ = write!(out, " (original: \"{original}\")");
                }
                out.push('\n');
            }
        }
    }

    out
}
