use crate::model::PageNumber;

/// How many pages the reader shows at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LayoutMode {
    #[default]
    Single,
    /// Two facing pages
    Spread,
}

impl LayoutMode {
    pub const fn visible_pages(self) -> u32 {
        match self {
            Self::Single => 1,
            Self::Spread => 2,
        }
    }
}

/// Pages to request after the reading position changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchPlan {
    /// Visible pages, requested at front priority
    pub front: Vec<PageNumber>,
    /// Pages just ahead of the visible ones, requested at back priority
    pub back: Vec<PageNumber>,
}

impl PrefetchPlan {
    pub fn is_empty(&self) -> bool {
        self.front.is_empty() && self.back.is_empty()
    }
}

/// Plan requests around `current`, skipping pages for which `settled`
/// returns true (translated or failed).
pub fn prefetch_plan(
    current: PageNumber,
    layout: LayoutMode,
    ahead: u32,
    total_pages: u32,
    settled: impl Fn(PageNumber) -> bool,
) -> PrefetchPlan {
    if total_pages == 0 {
        return PrefetchPlan::default();
    }
    let current = current.clamp(1, total_pages);
    let last_visible = current
        .saturating_add(layout.visible_pages() - 1)
        .min(total_pages);
    let last_ahead = last_visible.saturating_add(ahead).min(total_pages);

    PrefetchPlan {
        front: (current..=last_visible).filter(|&p| !settled(p)).collect(),
        back: (last_visible + 1..=last_ahead)
            .filter(|&p| !settled(p))
            .collect(),
    }
}

/// Pages for a translate-all run: from `current` to the end, then wrapping
/// around to page 1.
pub fn wrap_around_order(current: PageNumber, total_pages: u32) -> Vec<PageNumber> {
    if total_pages == 0 {
        return Vec::new();
    }
    let current = current.clamp(1, total_pages);
    (current..=total_pages).chain(1..current).collect()
}
