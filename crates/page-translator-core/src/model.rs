//! Project document model.
//!
//! One [`ProjectDocument`] exists per translated source document and is
//! persisted as a single JSON file. Every page-indexed map uses 1-based page
//! numbers, serialized as decimal string keys.
//!
//! Partial updates travel as a [`ProjectPatch`]: each page entry is a
//! [`Slot`], either a new value or an explicit tombstone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::error::Error;

/// 1-based page number.
pub type PageNumber = u32;

/// Map keyed by page number.
pub type PageMap<T> = BTreeMap<PageNumber, T>;

/// Partial update of a page map.
pub type PagePatch<T> = BTreeMap<PageNumber, Slot<T>>;

/// Stored as the translation of a page with no text, so the page counts as done.
pub const BLANK_PAGE_MARKER: &str = "<!-- blank page -->";

// =============================================================================
// Page records
// =============================================================================

/// Model identifier and save time written alongside translated or verified content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMeta {
    pub model: String,
    pub saved_at: DateTime<Utc>,
}

impl ContentMeta {
    pub fn now(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            saved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Doubt,
    Error,
}

/// A doubt or error flagged on a page's translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub kind: AnnotationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated: Option<String>,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    #[default]
    Idle,
    Verifying,
    Verified,
    Failed,
}

/// Verification outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Minor,
    Severe,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub state: VerificationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
    /// Whether a corrective re-translation changed the text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<bool>,
    /// The corrective hop ran and the result is still severe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_retry_failed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Verification {
    pub fn is_severe(&self) -> bool {
        self.severity == Some(Severity::Severe)
    }

    pub fn needs_retry(&self) -> bool {
        self.is_severe() || self.state == VerificationState::Failed
    }
}

/// Raster source override: the page is rendered from another document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageReplacement {
    pub source_file_path: String,
    pub source_page_number: PageNumber,
    pub updated_at: DateTime<Utc>,
}

/// Page rotation in quarter turns.
///
/// Stored values that are not a quarter turn load as [`Rotation::Deg0`] so
/// one bad entry never makes a document unreadable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

impl TryFrom<i64> for Rotation {
    type Error = Error;

    fn try_from(degrees: i64) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(Error::InvalidRotation(other)),
        }
    }
}

impl<'de> Deserialize<'de> for Rotation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let degrees = match &value {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        Ok(degrees
            .map(|d| d.rem_euclid(360))
            .and_then(|d| Self::try_from(d).ok())
            .unwrap_or_else(|| {
                tracing::debug!("Ignoring invalid stored rotation {}", value);
                Self::Deg0
            }))
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Relative paths into the project's asset directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageImages {
    #[serde(default)]
    pub sources: PageMap<String>,
    #[serde(default)]
    pub crops: PageMap<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageDims {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserHighlight {
    pub id: String,
    /// Character offset range into the page's visible text
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNote {
    pub id: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Project document
// =============================================================================

const fn first_page() -> PageNumber {
    1
}

/// Persisted state for one translated source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDocument {
    pub file_id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_language: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_pages: u32,
    #[serde(default = "first_page", deserialize_with = "lenient_count")]
    pub last_page: PageNumber,
    #[serde(default)]
    pub translations: PageMap<String>,
    #[serde(default)]
    pub translations_meta: PageMap<ContentMeta>,
    #[serde(default)]
    pub verifications_meta: PageMap<ContentMeta>,
    #[serde(default)]
    pub annotations: PageMap<Vec<Annotation>>,
    #[serde(default)]
    pub verifications: PageMap<Verification>,
    #[serde(default)]
    pub page_replacements: PageMap<PageReplacement>,
    #[serde(default)]
    pub rotations: PageMap<Rotation>,
    #[serde(default)]
    pub page_images: PageImages,
    #[serde(default)]
    pub page_dims: PageMap<PageDims>,
    #[serde(default)]
    pub user_highlights: PageMap<Vec<UserHighlight>>,
    #[serde(default)]
    pub user_notes: PageMap<Vec<UserNote>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectDocument {
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        original_file_path: Option<String>,
        total_pages: u32,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            original_file_path,
            total_pages,
            last_page: 1,
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// A page counts as translated when it has a non-empty translation.
    pub fn is_translated(&self, page: PageNumber) -> bool {
        self.translations
            .get(&page)
            .is_some_and(|text| !text.trim().is_empty())
    }

    pub fn translated_count(&self) -> usize {
        self.translations
            .values()
            .filter(|text| !text.trim().is_empty())
            .count()
    }

    pub fn pages(&self) -> impl Iterator<Item = PageNumber> {
        1..=self.total_pages
    }

    pub fn rotation(&self, page: PageNumber) -> Rotation {
        self.rotations.get(&page).copied().unwrap_or_default()
    }
}

/// Accept any JSON number or numeric string, coercing to a non-negative integer.
fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(coerce_count(&value))
}

fn lenient_count_opt<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_null()).map(|v| coerce_count(&v)))
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn coerce_count(value: &serde_json::Value) -> u32 {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if number.is_finite() {
        // Float-to-int casts saturate, so negatives become 0
        number.trunc().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

// =============================================================================
// Partial updates
// =============================================================================

/// A page entry in a partial update: write a value, or remove the key.
///
/// On the wire `Set` is the bare value and `Remove` is `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<T> {
    Set(T),
    Remove,
}

impl<T> Slot<T> {
    pub const fn as_set(&self) -> Option<&T> {
        match self {
            Self::Set(value) => Some(value),
            Self::Remove => None,
        }
    }
}

impl<T: Serialize> Serialize for Slot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Set(value) => value.serialize(serializer),
            Self::Remove => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Slot<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Option::<T>::deserialize(deserializer)?.map_or(Self::Remove, Self::Set))
    }
}

/// Image reference updates. Both `null` and `""` decode to a tombstone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageImagesPatch {
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "image_slots"
    )]
    pub sources: PagePatch<String>,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "image_slots"
    )]
    pub crops: PagePatch<String>,
}

impl PageImagesPatch {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.crops.is_empty()
    }
}

fn image_slots<'de, D>(deserializer: D) -> Result<PagePatch<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<PageNumber, Option<String>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(page, value)| {
            let slot = match value {
                Some(path) if !path.is_empty() => Slot::Set(path),
                _ => Slot::Remove,
            };
            (page, slot)
        })
        .collect())
}

/// A partial project update. Absent fields and absent page keys mean "no change".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_language: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_count_opt"
    )]
    pub total_pages: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_count_opt"
    )]
    pub last_page: Option<PageNumber>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub translations: PagePatch<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub translations_meta: PagePatch<ContentMeta>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verifications_meta: PagePatch<ContentMeta>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: PagePatch<Vec<Annotation>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verifications: PagePatch<Verification>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub page_replacements: PagePatch<PageReplacement>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rotations: PagePatch<Rotation>,
    #[serde(default, skip_serializing_if = "PageImagesPatch::is_empty")]
    pub page_images: PageImagesPatch,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub page_dims: PagePatch<PageDims>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_highlights: PagePatch<Vec<UserHighlight>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_notes: PagePatch<Vec<UserNote>>,
}

impl ProjectPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Store a finished translation, replacing annotations and dropping any
    /// verification of the previous text.
    pub fn translation(
        mut self,
        page: PageNumber,
        text: impl Into<String>,
        annotations: Vec<Annotation>,
        meta: ContentMeta,
    ) -> Self {
        self.translations.insert(page, Slot::Set(text.into()));
        self.translations_meta.insert(page, Slot::Set(meta));
        self.annotations.insert(page, Slot::Set(annotations));
        self.verifications.insert(page, Slot::Remove);
        self.verifications_meta.insert(page, Slot::Remove);
        self
    }

    pub fn verification(mut self, page: PageNumber, verification: Verification) -> Self {
        self.verifications.insert(page, Slot::Set(verification));
        self
    }

    pub fn verification_meta(mut self, page: PageNumber, meta: ContentMeta) -> Self {
        self.verifications_meta.insert(page, Slot::Set(meta));
        self
    }

    pub fn annotations(mut self, page: PageNumber, annotations: Vec<Annotation>) -> Self {
        self.annotations.insert(page, Slot::Set(annotations));
        self
    }

    /// Tombstone every translation-derived entry of a page.
    pub fn clear_page(mut self, page: PageNumber) -> Self {
        self.translations.insert(page, Slot::Remove);
        self.translations_meta.insert(page, Slot::Remove);
        self.annotations.insert(page, Slot::Remove);
        self.verifications.insert(page, Slot::Remove);
        self.verifications_meta.insert(page, Slot::Remove);
        self
    }

    pub fn last_page(mut self, page: PageNumber) -> Self {
        self.last_page = Some(page);
        self
    }

    pub fn rotation(mut self, page: PageNumber, rotation: Rotation) -> Self {
        self.rotations.insert(page, Slot::Set(rotation));
        self
    }
}
