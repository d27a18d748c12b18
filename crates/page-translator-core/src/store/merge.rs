//! Merge engine for partial project updates.
//!
//! Page maps merge key by key: incoming entries override, keys only present
//! in the stored document survive, and `Slot::Remove` deletes. An empty
//! incoming map therefore never clears anything.

use crate::model::{PagePatch, ProjectDocument, ProjectPatch, Slot};

/// Combine a stored document with a partial update.
pub fn merge_project_data(existing: ProjectDocument, incoming: &ProjectPatch) -> ProjectDocument {
    let mut merged = existing;

    overwrite(&mut merged.file_name, incoming.file_name.as_ref());
    if let Some(path) = &incoming.original_file_path {
        merged.original_file_path = Some(path.clone());
    }
    if let Some(lang) = &incoming.input_language {
        merged.input_language = Some(lang.clone());
    }
    overwrite(&mut merged.total_pages, incoming.total_pages.as_ref());
    overwrite(&mut merged.last_page, incoming.last_page.as_ref());

    apply_pages(&mut merged.translations, &incoming.translations);
    apply_pages(&mut merged.translations_meta, &incoming.translations_meta);
    apply_pages(&mut merged.verifications_meta, &incoming.verifications_meta);
    apply_pages(&mut merged.annotations, &incoming.annotations);
    apply_pages(&mut merged.verifications, &incoming.verifications);
    apply_pages(&mut merged.page_replacements, &incoming.page_replacements);
    apply_pages(&mut merged.rotations, &incoming.rotations);
    apply_pages(&mut merged.page_images.sources, &incoming.page_images.sources);
    apply_pages(&mut merged.page_images.crops, &incoming.page_images.crops);
    apply_pages(&mut merged.page_dims, &incoming.page_dims);
    apply_pages(&mut merged.user_highlights, &incoming.user_highlights);
    apply_pages(&mut merged.user_notes, &incoming.user_notes);

    clamp_last_page(&mut merged);
    merged
}

/// Clamp `last_page` into `[1, total_pages]` when the page count is known.
pub fn clamp_last_page(doc: &mut ProjectDocument) {
    if doc.total_pages > 0 {
        doc.last_page = doc.last_page.clamp(1, doc.total_pages);
    }
}

fn overwrite<T: Clone>(field: &mut T, incoming: Option<&T>) {
    if let Some(value) = incoming {
        field.clone_from(value);
    }
}

fn apply_pages<T: Clone>(target: &mut std::collections::BTreeMap<u32, T>, patch: &PagePatch<T>) {
    for (page, slot) in patch {
        match slot {
            Slot::Set(value) => {
                target.insert(*page, value.clone());
            }
            Slot::Remove => {
                target.remove(page);
            }
        }
    }
}

impl ProjectPatch {
    /// Fold a later patch into this one; the later patch wins per key.
    ///
    /// Folding `a` then `b` and merging once gives the same document as
    /// merging `a` and `b` in sequence.
    pub fn absorb(&mut self, later: Self) {
        let Self {
            file_name,
            original_file_path,
            input_language,
            total_pages,
            last_page,
            translations,
            translations_meta,
            verifications_meta,
            annotations,
            verifications,
            page_replacements,
            rotations,
            page_images,
            page_dims,
            user_highlights,
            user_notes,
        } = later;

        replace_if_some(&mut self.file_name, file_name);
        replace_if_some(&mut self.original_file_path, original_file_path);
        replace_if_some(&mut self.input_language, input_language);
        replace_if_some(&mut self.total_pages, total_pages);
        replace_if_some(&mut self.last_page, last_page);

        self.translations.extend(translations);
        self.translations_meta.extend(translations_meta);
        self.verifications_meta.extend(verifications_meta);
        self.annotations.extend(annotations);
        self.verifications.extend(verifications);
        self.page_replacements.extend(page_replacements);
        self.rotations.extend(rotations);
        self.page_images.sources.extend(page_images.sources);
        self.page_images.crops.extend(page_images.crops);
        self.page_dims.extend(page_dims);
        self.user_highlights.extend(user_highlights);
        self.user_notes.extend(user_notes);
    }
}

fn replace_if_some<T>(field: &mut Option<T>, later: Option<T>) {
    if later.is_some() {
        *field = later;
    }
}
