use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::client::ConfluenceApi;
use crate::interactive::Confirm;
use crate::model::PageRef;
use crate::tags::get_page_tags;

const TITLE_WIDTH_CAP: usize = 50;
const SPACE_WIDTH_CAP: usize = 20;
const RULE_WIDTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageTags {
    pub id: String,
    pub title: String,
    pub space: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagListing {
    pub pages: Vec<PageTags>,
    pub all_tags: BTreeSet<String>,
}

/// Fetch the labels of every page that has an id.
pub fn collect_page_tags<A: ConfluenceApi + ?Sized>(api: &mut A, pages: &[PageRef]) -> TagListing {
    let mut listing = TagListing::default();
    for page in pages {
        let title = page.display_title();
        let Some(id) = page.id.as_deref() else {
            warn!("skipping page with no id: {title}");
            continue;
        };
        let tags = get_page_tags(api, id);
        listing.all_tags.extend(tags.iter().cloned());
        listing.pages.push(PageTags {
            id: id.to_string(),
            title,
            space: page.space_label().to_string(),
            tags,
        });
    }
    listing
}

/// Keep the pages the user chooses to include.
pub fn select_pages(pages: Vec<PageTags>, confirm: &mut dyn Confirm) -> Vec<PageTags> {
    pages
        .into_iter()
        .filter(|page| {
            let tags = if page.tags.is_empty() {
                "None".to_string()
            } else {
                page.tags.join(", ")
            };
            let item = format!("'{}' (Space: {}, Tags: {tags})", page.title, page.space);
            confirm.confirm_action(&item, "Include in results")
        })
        .collect()
}

pub fn format_tags_only(tags: &BTreeSet<String>, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(tags).context("failed to serialize tags")
        }
        OutputFormat::Table => Ok(tag_table(tags)),
    }
}

pub fn format_page_data(
    pages: &[PageTags],
    format: OutputFormat,
    show_pages: bool,
) -> Result<String> {
    if !show_pages {
        let tags = pages
            .iter()
            .flat_map(|page| page.tags.iter().cloned())
            .collect::<BTreeSet<_>>();
        return format_tags_only(&tags, format);
    }
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(pages).context("failed to serialize page tags")
        }
        OutputFormat::Table => Ok(page_table(pages)),
    }
}

fn tag_table(tags: &BTreeSet<String>) -> String {
    if tags.is_empty() {
        return "No tags found.".to_string();
    }
    let mut lines = vec!["Tags found:".to_string(), "=".repeat(RULE_WIDTH)];
    lines.extend(tags.iter().map(|tag| format!("  {tag}")));
    lines.join("\n")
}

fn page_table(pages: &[PageTags]) -> String {
    if pages.is_empty() {
        return "No pages found.".to_string();
    }
    let title_width = column_width(
        pages.iter().map(|page| page.title.as_str()),
        "Title",
        TITLE_WIDTH_CAP,
    );
    let space_width = column_width(
        pages.iter().map(|page| page.space.as_str()),
        "Space",
        SPACE_WIDTH_CAP,
    );

    let header = format!("{:<title_width$} {:<space_width$} Tags", "Title", "Space");
    let mut lines = vec![header.clone(), "=".repeat(header.chars().count())];
    for page in pages {
        let tags = if page.tags.is_empty() {
            "(no tags)".to_string()
        } else {
            page.tags.join(", ")
        };
        lines.push(format!(
            "{:<title_width$} {:<space_width$} {tags}",
            truncate(&page.title, title_width),
            truncate(&page.space, space_width)
        ));
    }
    lines.join("\n")
}

fn column_width<'a>(values: impl Iterator<Item = &'a str>, header: &str, cap: usize) -> usize {
    values
        .map(|value| value.chars().count())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0)
        .min(cap)
}

fn truncate(value: &str, width: usize) -> String {
    value.chars().take(width).collect()
}
