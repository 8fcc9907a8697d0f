use serde::Serialize;
use tracing::info;

use crate::client::ConfluenceApi;
use crate::interactive::Confirm;
use crate::model::{PageRef, ResultTally, TagCommand, TagOperation};
use crate::query::{DEFAULT_BATCH_SIZE, expand_descendants, filter_excluded, get_all_results};
use crate::tags::{ProgressSink, process_pages};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    pub recurse: bool,
    pub batch_size: usize,
    pub expand: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            recurse: false,
            batch_size: DEFAULT_BATCH_SIZE,
            expand: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageSelection {
    pub pages: Vec<PageRef>,
    /// Pages returned by the main query, including descendants with `--recurse`.
    pub matched: usize,
    /// Whether an exclusion query ran.
    pub exclusion_applied: bool,
    pub excluded: usize,
}

impl PageSelection {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Resolve the page set for one query: main query, optional descendants, then
/// the exclusion query.
pub fn resolve_pages<A: ConfluenceApi + ?Sized>(
    api: &mut A,
    cql_expression: &str,
    cql_exclude: Option<&str>,
    options: &RunOptions,
) -> PageSelection {
    let expand = options.expand.as_deref();
    let mut pages = get_all_results(api, cql_expression, expand, options.batch_size);
    if options.recurse && !pages.is_empty() {
        pages = expand_descendants(api, pages, expand, options.batch_size);
    }
    let matched = pages.len();

    let mut selection = PageSelection {
        pages,
        matched,
        exclusion_applied: false,
        excluded: 0,
    };
    if matched == 0 {
        return selection;
    }

    if let Some(exclude) = cql_exclude {
        let excluded_pages = get_all_results(api, exclude, expand, options.batch_size);
        selection.exclusion_applied = true;
        if !excluded_pages.is_empty() {
            let remaining = filter_excluded(std::mem::take(&mut selection.pages), &excluded_pages);
            selection.pages = remaining;
            selection.excluded = matched - selection.pages.len();
        }
        info!(
            matched,
            excluded = selection.excluded,
            "applied exclusion query"
        );
    }
    selection
}

/// One dry-run line, e.g. `Would add tags [a] to 'Page' (Space: DOCS)`.
pub fn preview_line(operation: &TagOperation, page: &PageRef) -> String {
    format!(
        "Would {} '{}' (Space: {})",
        lowercase_first(&operation.describe()),
        page.display_title(),
        page.space_label()
    )
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    NoPages,
    DryRun { previews: Vec<String> },
    Applied(ResultTally),
}

impl CommandOutcome {
    /// Contribution to a batch total; dry runs and empty selections add nothing.
    pub fn tally(&self) -> ResultTally {
        match self {
            Self::Applied(tally) => *tally,
            Self::NoPages | Self::DryRun { .. } => ResultTally::default(),
        }
    }

    pub fn aborted(&self) -> bool {
        matches!(self, Self::Applied(tally) if tally.aborted)
    }
}

/// Hooks the command runner calls while it works, so the caller can report as
/// it goes and supply the confirmation prompt.
pub trait CommandObserver {
    fn command_started(&mut self, _position: usize, _count: usize, _command: &TagCommand) {}
    fn pages_resolved(&mut self, _command: &TagCommand, _selection: &PageSelection) {}
    fn command_finished(
        &mut self,
        _position: usize,
        _command: &TagCommand,
        _outcome: &CommandOutcome,
    ) {
    }
    /// Confirmer for an interactive command; `None` applies without asking.
    fn confirmer(&mut self, command: &TagCommand) -> Option<Box<dyn Confirm>>;
    fn progress(&mut self) -> &mut dyn ProgressSink;
}

/// Resolve, preview or apply one command.
pub fn run_command<A, O>(
    api: &mut A,
    command: &TagCommand,
    options: &RunOptions,
    observer: &mut O,
) -> CommandOutcome
where
    A: ConfluenceApi + ?Sized,
    O: CommandObserver + ?Sized,
{
    let selection = resolve_pages(api, command.cql_expression(), command.cql_exclude(), options);
    observer.pages_resolved(command, &selection);
    if selection.is_empty() {
        return CommandOutcome::NoPages;
    }

    if options.dry_run {
        let previews = selection
            .pages
            .iter()
            .map(|page| preview_line(command.operation(), page))
            .collect();
        return CommandOutcome::DryRun { previews };
    }

    let mut confirm = if command.interactive() {
        observer.confirmer(command)
    } else {
        None
    };
    let tally = process_pages(
        api,
        &selection.pages,
        command.operation(),
        confirm.as_deref_mut(),
        observer.progress(),
    );
    CommandOutcome::Applied(tally)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub commands: usize,
    pub executed: usize,
    pub overall: ResultTally,
    pub stopped_by_abort: bool,
}

/// Run commands in order, summing their tallies. Stops after the first
/// command whose tally reports an abort.
pub fn run_batch<A, O>(
    api: &mut A,
    commands: &[TagCommand],
    options: &RunOptions,
    observer: &mut O,
) -> BatchReport
where
    A: ConfluenceApi + ?Sized,
    O: CommandObserver + ?Sized,
{
    let mut report = BatchReport {
        commands: commands.len(),
        ..BatchReport::default()
    };
    for (index, command) in commands.iter().enumerate() {
        let position = index + 1;
        observer.command_started(position, commands.len(), command);
        let outcome = run_command(api, command, options, observer);
        report.executed += 1;
        report.overall += outcome.tally();
        observer.command_finished(position, command, &outcome);
        if outcome.aborted() {
            info!(position, "batch stopped after abort");
            report.stopped_by_abort = true;
            break;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{
        CommandObserver, CommandOutcome, PageSelection, RunOptions, preview_line, resolve_pages,
        run_batch, run_command,
    };
    use crate::interactive::Confirm;
    use crate::model::{TagCommand, TagOperation};
    use crate::tags::tests::{MockApi, ScriptedConfirm, page};
    use crate::tags::{NoProgress, ProgressSink};

    fn raw(id: &str, title: &str) -> Value {
        json!({
            "content": {"id": id},
            "title": title,
            "resultGlobalContainer": {"title": "Docs"}
        })
    }

    fn api_with_pages() -> MockApi {
        let mut api = MockApi::default();
        api.search_results.insert(
            "space = DOCS".to_string(),
            vec![raw("1", "One"), raw("2", "Two"), raw("3", "Three")],
        );
        api.search_results
            .insert("label = keep".to_string(), vec![raw("2", "Two")]);
        api.search_results
            .insert("ancestor = 1".to_string(), vec![raw("4", "Child")]);
        api
    }

    fn add(cql: &str, exclude: Option<&str>, interactive: bool) -> TagCommand {
        TagCommand::new(
            TagOperation::Add(vec!["x".to_string()]),
            cql,
            interactive,
            exclude,
        )
        .expect("command")
    }

    struct Recorder {
        answers: Vec<Vec<Option<bool>>>,
        events: Vec<String>,
        progress: NoProgress,
    }

    impl Recorder {
        fn new(answers: Vec<Vec<Option<bool>>>) -> Self {
            Self {
                answers: answers.into_iter().rev().collect(),
                events: Vec::new(),
                progress: NoProgress,
            }
        }
    }

    impl CommandObserver for Recorder {
        fn command_started(&mut self, position: usize, count: usize, _: &TagCommand) {
            self.events.push(format!("start {position}/{count}"));
        }

        fn pages_resolved(&mut self, _: &TagCommand, selection: &PageSelection) {
            self.events.push(format!("pages {}", selection.pages.len()));
        }

        fn confirmer(&mut self, _: &TagCommand) -> Option<Box<dyn Confirm>> {
            let answers = self.answers.pop().unwrap_or_default();
            Some(Box::new(ScriptedConfirm::new(answers)))
        }

        fn progress(&mut self) -> &mut dyn ProgressSink {
            &mut self.progress
        }
    }

    #[test]
    fn resolve_pages_applies_exclusion_by_id() {
        let mut api = api_with_pages();
        let selection = resolve_pages(
            &mut api,
            "space = DOCS",
            Some("label = keep"),
            &RunOptions::default(),
        );
        assert_eq!(selection.matched, 3);
        assert_eq!(selection.excluded, 1);
        assert!(selection.exclusion_applied);
        let ids = selection
            .pages
            .iter()
            .filter_map(|page| page.id.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn resolve_pages_expands_descendants_before_exclusion() {
        let mut api = api_with_pages();
        api.search_results
            .insert("label = child".to_string(), vec![raw("4", "Child")]);
        let options = RunOptions {
            recurse: true,
            ..RunOptions::default()
        };

        let selection = resolve_pages(&mut api, "space = DOCS", None, &options);
        assert_eq!(selection.matched, 4);
        assert_eq!(selection.pages[3].id.as_deref(), Some("4"));

        let selection = resolve_pages(&mut api, "space = DOCS", Some("label = child"), &options);
        assert_eq!(selection.pages.len(), 3);
        assert_eq!(selection.excluded, 1);
    }

    #[test]
    fn dry_run_previews_every_page_without_mutating() {
        let mut api = api_with_pages();
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let mut observer = Recorder::new(Vec::new());

        let command = add("space = DOCS", None, true);
        let outcome = run_command(&mut api, &command, &options, &mut observer);
        let CommandOutcome::DryRun { previews } = outcome else {
            panic!("expected dry run outcome");
        };
        assert_eq!(previews.len(), 3);
        assert_eq!(previews[0], "Would add tags [x] to 'One' (Space: Docs)");
        assert!(api.mutations.is_empty());
        assert!(api.labels.is_empty());
    }

    #[test]
    fn no_matching_pages_is_not_an_error() {
        let mut api = api_with_pages();
        let mut observer = Recorder::new(Vec::new());
        let outcome = run_command(
            &mut api,
            &add("space = NONE", None, false),
            &RunOptions::default(),
            &mut observer,
        );
        assert_eq!(outcome, CommandOutcome::NoPages);
        assert_eq!(outcome.tally().total, 0);
    }

    #[test]
    fn batch_sums_tallies_and_continues_past_empty_commands() {
        let mut api = api_with_pages();
        let commands = vec![
            add("space = DOCS", Some("label = keep"), false),
            add("space = NONE", None, false),
            add("space = DOCS", None, false),
        ];
        let mut observer = Recorder::new(Vec::new());

        let report = run_batch(&mut api, &commands, &RunOptions::default(), &mut observer);
        assert_eq!(report.executed, 3);
        assert_eq!(report.overall.total, 5);
        assert_eq!(report.overall.success, 5);
        assert!(!report.stopped_by_abort);
        assert_eq!(
            observer.events,
            vec!["start 1/3", "pages 2", "start 2/3", "pages 0", "start 3/3", "pages 3"]
        );
    }

    #[test]
    fn batch_stops_after_aborted_command() {
        let mut api = api_with_pages();
        let commands = vec![
            add("space = DOCS", None, true),
            add("space = DOCS", None, false),
        ];
        let mut observer = Recorder::new(vec![vec![Some(true), None]]);

        let report = run_batch(&mut api, &commands, &RunOptions::default(), &mut observer);
        assert_eq!(report.executed, 1);
        assert!(report.stopped_by_abort);
        assert!(report.overall.aborted);
        assert_eq!(report.overall.success, 1);
        assert_eq!(report.overall.skipped, 2);
        assert_eq!(api.mutations, vec!["add 1 x"]);
    }

    #[test]
    fn dry_run_previews_pattern_operations_without_reading_labels() {
        let mut api = api_with_pages();
        let operation = TagOperation::Remove(vec!["test-.*".to_string()])
            .into_matching()
            .expect("patterns");
        let command = TagCommand::new(operation, "space = DOCS", false, None).expect("command");
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let mut observer = Recorder::new(Vec::new());

        let outcome = run_command(&mut api, &command, &options, &mut observer);
        let CommandOutcome::DryRun { previews } = outcome else {
            panic!("expected dry run outcome");
        };
        assert_eq!(
            previews[0],
            "Would remove tags matching [test-.*] from 'One' (Space: Docs)"
        );
        assert!(api.mutations.is_empty());
        assert_eq!(api.requests, 1);
    }

    #[test]
    fn preview_line_describes_replace() {
        let operation = TagOperation::Replace([("old", "new")].into_iter().collect());
        assert_eq!(
            preview_line(&operation, &page(Some("1"), "Page")),
            "Would replace tags [old] with [new] on 'Page' (Space: DOCS)"
        );
    }
}
