use std::borrow::Cow;
use std::collections::HashSet;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::client::ConfluenceApi;
use crate::interactive::Confirm;
use crate::model::{PageRef, ResultTally, TagMapping, TagOperation, TagPattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Success,
    Failed,
    Skipped,
}

impl PageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Receives one notification per page handled by [`process_pages`].
pub trait ProgressSink {
    fn page_done(&mut self, position: usize, total: usize, page: &PageRef, outcome: PageOutcome);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn page_done(&mut self, _: usize, _: usize, _: &PageRef, _: PageOutcome) {}
}

/// Current labels of a page; empty when they cannot be fetched.
pub fn get_page_tags<A: ConfluenceApi + ?Sized>(api: &mut A, page_id: &str) -> Vec<String> {
    match api.get_page_labels(page_id) {
        Ok(labels) => labels,
        Err(err) => {
            error!("error getting tags for page {page_id}: {err:#}");
            Vec::new()
        }
    }
}

/// Add each tag in turn. Returns `true` only if every tag was added.
pub fn add_tags<A: ConfluenceApi + ?Sized>(api: &mut A, page_id: &str, tags: &[String]) -> bool {
    let mut all_ok = true;
    for tag in tags {
        match api.set_page_label(page_id, tag) {
            Ok(()) => info!("added tag '{tag}' to page {page_id}"),
            Err(err) => {
                error!("error adding tag '{tag}' to page {page_id}: {err:#}");
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Remove each tag in turn. Returns `true` only if every removal succeeded.
pub fn remove_tags<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    page_id: &str,
    tags: &[String],
) -> bool {
    let mut all_ok = true;
    for tag in tags {
        match api.remove_page_label(page_id, tag) {
            Ok(()) => info!("removed tag '{tag}' from page {page_id}"),
            Err(err) => {
                error!("error removing tag '{tag}' from page {page_id}: {err:#}");
                all_ok = false;
            }
        }
    }
    all_ok
}

/// Swap `old` for `new` on a page, for the pairs whose `old` the page carries.
/// A pair whose removal fails does not get its `new` tag added.
pub fn replace_tags<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    page_id: &str,
    mapping: &TagMapping,
) -> bool {
    let current = match api.get_page_labels(page_id) {
        Ok(labels) => labels.into_iter().collect::<HashSet<_>>(),
        Err(err) => {
            error!("error reading tags of page {page_id} before replace: {err:#}");
            return false;
        }
    };

    let mut all_ok = true;
    for (old, new) in mapping.iter() {
        if !current.contains(old) {
            debug!("page {page_id} has no tag '{old}'; skipping {old}={new}");
            continue;
        }
        if !remove_tags(api, page_id, &[old.to_string()]) {
            all_ok = false;
            continue;
        }
        if !add_tags(api, page_id, &[new.to_string()]) {
            all_ok = false;
        }
    }
    all_ok
}

/// Current labels matched by any pattern, in page order.
pub fn filter_tags_by_pattern(current: &[String], patterns: &[TagPattern]) -> Vec<String> {
    current
        .iter()
        .filter(|tag| patterns.iter().any(|pattern| pattern.is_match(tag)))
        .cloned()
        .collect()
}

/// `label -> new` for every current label a pattern matches. The first
/// matching pattern wins; a label already equal to its target is left alone.
pub fn compute_pattern_replacements(
    current: &[String],
    pairs: &[(TagPattern, String)],
) -> TagMapping {
    let mut mapping = TagMapping::new();
    for tag in current {
        let target = pairs
            .iter()
            .find(|(pattern, _)| pattern.is_match(tag))
            .map(|(_, new)| new);
        if let Some(new) = target.filter(|new| *new != tag) {
            mapping.insert(tag.as_str(), new.as_str());
        }
    }
    mapping
}

/// The concrete operation for one page. Pattern operations are matched
/// against the page's current labels; plain ones come back as they are.
pub fn resolve_for_page<'a, A: ConfluenceApi + ?Sized>(
    api: &mut A,
    page_id: &str,
    operation: &'a TagOperation,
) -> Result<Cow<'a, TagOperation>> {
    let resolved = match operation {
        TagOperation::RemoveMatching(patterns) => {
            let current = api.get_page_labels(page_id)?;
            TagOperation::Remove(filter_tags_by_pattern(&current, patterns))
        }
        TagOperation::ReplaceMatching(pairs) => {
            let current = api.get_page_labels(page_id)?;
            TagOperation::Replace(compute_pattern_replacements(&current, pairs))
        }
        plain => return Ok(Cow::Borrowed(plain)),
    };
    Ok(Cow::Owned(resolved))
}

/// Apply one operation to one page. Returns `true` only if every change
/// succeeded.
pub fn apply_operation<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    page_id: &str,
    operation: &TagOperation,
) -> bool {
    match operation {
        TagOperation::Add(tags) => add_tags(api, page_id, tags),
        TagOperation::Remove(tags) => remove_tags(api, page_id, tags),
        TagOperation::Replace(mapping) => replace_tags(api, page_id, mapping),
        TagOperation::RemoveMatching(_) | TagOperation::ReplaceMatching(_) => {
            match resolve_for_page(api, page_id, operation) {
                Ok(resolved) => apply_operation(api, page_id, &resolved),
                Err(err) => {
                    error!("error reading tags of page {page_id}: {err:#}");
                    false
                }
            }
        }
    }
}

/// Apply one operation to every page, confirming each page first when a
/// confirmer is given.
pub fn process_pages<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    pages: &[PageRef],
    operation: &TagOperation,
    mut confirm: Option<&mut (dyn Confirm + '_)>,
    progress: &mut dyn ProgressSink,
) -> ResultTally {
    let total = pages.len();
    let mut tally = ResultTally::new(total);

    for (index, page) in pages.iter().enumerate() {
        let position = index + 1;
        let outcome = process_page(api, page, operation, confirm.as_deref_mut());
        match outcome {
            PageOutcome::Success => {
                tally.processed += 1;
                tally.success += 1;
            }
            PageOutcome::Failed => {
                tally.processed += 1;
                tally.failed += 1;
            }
            PageOutcome::Skipped => tally.skipped += 1,
        }
        progress.page_done(position, total, page, outcome);
    }

    if confirm.is_some_and(|handler| handler.is_aborted()) {
        tally.aborted = true;
    }
    tally
}

fn process_page<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    page: &PageRef,
    operation: &TagOperation,
    confirm: Option<&mut (dyn Confirm + '_)>,
) -> PageOutcome {
    let Some(page_id) = page.id.as_deref() else {
        warn!("skipping page '{}' without an id", page.display_title());
        return PageOutcome::Skipped;
    };
    if confirm.as_deref().is_some_and(|handler| handler.is_aborted()) {
        return PageOutcome::Skipped;
    }

    let operation = match resolve_for_page(api, page_id, operation) {
        Ok(resolved) => resolved,
        Err(err) => {
            error!("error reading tags of page {page_id}: {err:#}");
            return PageOutcome::Failed;
        }
    };
    if operation.is_noop() {
        debug!("no tags on page {page_id} match; skipping");
        return PageOutcome::Skipped;
    }

    if let Some(handler) = confirm {
        let item = format!("'{}'", page.display_title());
        if !handler.confirm_action(&item, &operation.describe()) {
            info!("skipped page {page_id}");
            return PageOutcome::Skipped;
        }
    }

    if apply_operation(api, page_id, &operation) {
        PageOutcome::Success
    } else {
        PageOutcome::Failed
    }
}
