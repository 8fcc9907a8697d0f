use std::collections::HashSet;

use anyhow::{Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::client::ConfluenceApi;
use crate::model::PageRef;

pub const DEFAULT_EXPAND: &str = "space,metadata.labels,version";
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Run one page of a query. Failures are logged and yield an empty batch.
pub fn execute_query<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    cql_expression: &str,
    start: usize,
    limit: usize,
    expand: Option<&str>,
) -> Vec<PageRef> {
    let expand = expand
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(DEFAULT_EXPAND);
    info!(cql = cql_expression, start, limit, "executing CQL query");

    let items = match api.search(cql_expression, start, limit, expand) {
        Ok(items) => items,
        Err(err) => {
            error!("error executing CQL query '{cql_expression}': {err:#}");
            return Vec::new();
        }
    };

    let mut pages = Vec::with_capacity(items.len());
    for item in &items {
        match page_from_search_result(item) {
            Ok(page) => pages.push(page),
            Err(err) => error!("skipping unreadable search result: {err:#}"),
        }
    }
    info!(count = pages.len(), "CQL query returned results");
    pages
}

/// Fetch every page of a query, stopping at the first empty or short batch.
pub fn get_all_results<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    cql_expression: &str,
    expand: Option<&str>,
    batch_size: usize,
) -> Vec<PageRef> {
    let batch_size = batch_size.max(1);
    let mut all_pages = Vec::new();
    let mut start = 0usize;

    loop {
        let batch = execute_query(api, cql_expression, start, batch_size, expand);
        if batch.is_empty() {
            break;
        }
        let batch_len = batch.len();
        all_pages.extend(batch);
        if batch_len < batch_size {
            break;
        }
        start += batch_size;
    }

    all_pages
}

/// Drop pages whose id appears among the excluded pages. Pages without an id
/// are never excluded, and excluded pages without an id exclude nothing.
pub fn filter_excluded(pages: Vec<PageRef>, excluded: &[PageRef]) -> Vec<PageRef> {
    let excluded_ids = excluded
        .iter()
        .filter_map(|page| page.id.as_deref())
        .collect::<HashSet<_>>();
    if excluded_ids.is_empty() {
        return pages;
    }
    pages
        .into_iter()
        .filter(|page| match page.id.as_deref() {
            Some(id) => !excluded_ids.contains(id),
            None => true,
        })
        .collect()
}

/// Append the descendants of every matched page, de-duplicated by id.
pub fn expand_descendants<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    pages: Vec<PageRef>,
    expand: Option<&str>,
    batch_size: usize,
) -> Vec<PageRef> {
    let mut seen = pages
        .iter()
        .filter_map(|page| page.id.clone())
        .collect::<HashSet<_>>();
    let roots = pages
        .iter()
        .filter_map(|page| page.id.clone())
        .collect::<Vec<_>>();
    let mut output = pages;

    for root in roots {
        let cql = format!("ancestor = {root}");
        for child in get_all_results(api, &cql, expand, batch_size) {
            match &child.id {
                Some(id) if !seen.insert(id.clone()) => {}
                _ => output.push(child),
            }
        }
    }
    output
}

/// Normalize one raw search result. Falls back to a bare id + title read when
/// the item does not fit the expected shape.
pub fn page_from_search_result(item: &Value) -> Result<PageRef> {
    match serde_json::from_value::<SearchResultItem>(item.clone()) {
        Ok(parsed) => Ok(parsed.into_page_ref()),
        Err(err) => {
            warn!("search result did not match expected shape ({err}); trying minimal read");
            minimal_page_ref(item)
        }
    }
}

fn minimal_page_ref(item: &Value) -> Result<PageRef> {
    let Some(object) = item.as_object() else {
        bail!("search result is not an object: {item}");
    };
    let content = object.get("content");
    let id = content.and_then(|content| content.get("id")).and_then(id_string);
    let title = object
        .get("title")
        .or_else(|| content.and_then(|content| content.get("title")))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    if id.is_none() && title.is_none() {
        bail!("search result has neither content.id nor title: {item}");
    }
    Ok(PageRef {
        id,
        title: title.unwrap_or_default(),
        space: None,
    })
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct SearchResultItem {
    content: Option<ContentItem>,
    title: Option<String>,
    #[serde(rename = "resultGlobalContainer")]
    result_global_container: Option<GlobalContainer>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    id: Option<String>,
    title: Option<String>,
    space: Option<SpaceItem>,
}

#[derive(Debug, Deserialize)]
struct SpaceItem {
    key: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlobalContainer {
    title: Option<String>,
}

impl SearchResultItem {
    fn into_page_ref(self) -> PageRef {
        let (id, content_title, content_space) = match self.content {
            Some(content) => (
                content.id.filter(|id| !id.trim().is_empty()),
                content.title,
                content.space.and_then(|space| space.name.or(space.key)),
            ),
            None => (None, None, None),
        };
        PageRef {
            id,
            title: self.title.or(content_title).unwrap_or_default(),
            space: self
                .result_global_container
                .and_then(|container| container.title)
                .or(content_space),
        }
    }
}
