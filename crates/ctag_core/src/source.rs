use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::Path;

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecord, Trim, Writer};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::model::{TagAction, TagCommand, TagMapping, TagOperation, parse_tag_pair};

pub const CSV_COLUMNS: [&str; 5] = [
    "action",
    "cql_expression",
    "tags",
    "interactive",
    "cql_exclude",
];
const REQUIRED_CSV_COLUMNS: [&str; 3] = ["action", "cql_expression", "tags"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFormat {
    Csv,
    Json,
}

impl CommandFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("csv") => Ok(Self::Csv),
            Some("json") => Ok(Self::Json),
            _ => bail!(
                "cannot tell command file format of {} (expected .csv or .json)",
                path.display()
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    pub description: Option<String>,
    pub commands: Vec<TagCommand>,
    /// Entries that were logged and dropped.
    pub rejected: usize,
}

pub fn read_commands_from_csv(path: &Path) -> Result<CommandBatch> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open CSV file {}", path.display()))?;
    read_commands_from_csv_reader(file)
        .with_context(|| format!("failed to read CSV file {}", path.display()))
}

/// Parse CSV command rows. A bad header is fatal; a bad row is logged and skipped.
pub fn read_commands_from_csv_reader<R: Read>(input: R) -> Result<CommandBatch> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input);
    let headers = reader.headers().context("failed to read CSV header")?.clone();
    let columns = CsvColumns::locate(&headers)?;

    let mut batch = CommandBatch {
        description: None,
        commands: Vec::new(),
        rejected: 0,
    };
    for (index, record) in reader.records().enumerate() {
        let row_number = index + 1;
        let parsed = record
            .context("malformed CSV record")
            .and_then(|record| columns.command(&record, row_number));
        match parsed {
            Ok(command) => batch.commands.push(command),
            Err(err) => {
                error!("error processing row {row_number}: {err:#}");
                batch.rejected += 1;
            }
        }
    }
    info!(
        commands = batch.commands.len(),
        rejected = batch.rejected,
        "read CSV commands"
    );
    Ok(batch)
}

struct CsvColumns {
    action: usize,
    cql_expression: usize,
    tags: usize,
    interactive: Option<usize>,
    cql_exclude: Option<usize>,
    regex: Option<usize>,
}

impl CsvColumns {
    fn locate(headers: &StringRecord) -> Result<Self> {
        if headers.iter().all(str::is_empty) {
            bail!("CSV file has no header row");
        }
        let find = |name: &str| {
            headers
                .iter()
                .position(|header| header.eq_ignore_ascii_case(name))
        };
        for name in REQUIRED_CSV_COLUMNS {
            if find(name).is_none() {
                bail!("CSV file is missing required column: {name}");
            }
        }
        Ok(Self {
            action: find("action").unwrap_or_default(),
            cql_expression: find("cql_expression").unwrap_or_default(),
            tags: find("tags").unwrap_or_default(),
            interactive: find("interactive"),
            cql_exclude: find("cql_exclude"),
            regex: find("regex"),
        })
    }

    fn command(&self, record: &StringRecord, row_number: usize) -> Result<TagCommand> {
        let field = |index: usize| record.get(index).unwrap_or("");
        let action = TagAction::parse(field(self.action))?;
        let tags = field(self.tags);
        let interactive = self
            .interactive
            .map(|index| parse_flag(field(index)))
            .unwrap_or(false);
        let cql_exclude = self.cql_exclude.map(field);
        let regex = self.regex.is_some_and(|index| parse_flag(field(index)));

        let mut operation = match action {
            TagAction::Add => TagOperation::Add(split_list(tags)),
            TagAction::Remove => TagOperation::Remove(split_list(tags)),
            TagAction::Replace => TagOperation::Replace(lenient_pairs(tags, row_number)),
        };
        if regex {
            operation = operation.into_matching()?;
        }
        TagCommand::new(operation, field(self.cql_expression), interactive, cql_exclude)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn lenient_pairs(value: &str, row_number: usize) -> TagMapping {
    let mut mapping = TagMapping::new();
    for pair in value.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        match parse_tag_pair(pair) {
            Ok((old, new)) => mapping.insert(old, new),
            Err(err) => warn!("ignoring tag pair in row {row_number}: {err}"),
        }
    }
    mapping
}

#[derive(Debug, Deserialize)]
struct CommandsFile {
    description: Option<String>,
    commands: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    action: String,
    cql_expression: String,
    tags: RawTags,
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    cql_exclude: Option<String>,
    #[serde(default)]
    regex: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTags {
    List(Vec<String>),
    Mapping(TagMapping),
}

impl RawCommand {
    fn into_command(self) -> Result<TagCommand> {
        let action = TagAction::parse(&self.action)?;
        let mut operation = match (action, self.tags) {
            (TagAction::Add, RawTags::List(tags)) => TagOperation::Add(tags),
            (TagAction::Remove, RawTags::List(tags)) => TagOperation::Remove(tags),
            (TagAction::Replace, RawTags::Mapping(mapping)) => TagOperation::Replace(mapping),
            (TagAction::Replace, RawTags::List(_)) => {
                bail!("'replace' action requires tags to be an object of old/new pairs")
            }
            (action, RawTags::Mapping(_)) => {
                bail!("'{}' action requires tags to be a list", action.as_str())
            }
        };
        if self.regex {
            operation = operation.into_matching()?;
        }
        TagCommand::new(
            operation,
            &self.cql_expression,
            self.interactive,
            self.cql_exclude.as_deref(),
        )
    }
}

/// Parse a JSON command document. The envelope must be valid; individual
/// commands that fail validation are logged and skipped.
pub fn parse_commands_json(text: &str) -> Result<CommandBatch> {
    let file: CommandsFile =
        serde_json::from_str(text).context("invalid JSON command document")?;

    let mut batch = CommandBatch {
        description: file.description.filter(|value| !value.trim().is_empty()),
        commands: Vec::new(),
        rejected: 0,
    };
    for (index, raw) in file.commands.into_iter().enumerate() {
        let parsed = serde_json::from_value::<RawCommand>(raw)
            .map_err(anyhow::Error::from)
            .and_then(RawCommand::into_command);
        match parsed {
            Ok(command) => batch.commands.push(command),
            Err(err) => {
                error!("invalid command at index {index}: {err:#}");
                batch.rejected += 1;
            }
        }
    }
    info!(
        commands = batch.commands.len(),
        rejected = batch.rejected,
        "read JSON commands"
    );
    Ok(batch)
}

pub fn read_commands_from_json(path: &Path) -> Result<CommandBatch> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read JSON file {}", path.display()))?;
    parse_commands_json(&text).with_context(|| format!("failed to load {}", path.display()))
}

pub fn read_commands_from_stdin() -> Result<CommandBatch> {
    let mut text = String::new();
    io::stdin()
        .read_to_string(&mut text)
        .context("failed to read commands from stdin")?;
    if text.trim().is_empty() {
        bail!("no JSON data received on stdin");
    }
    parse_commands_json(&text)
}

/// Whether stdin is piped or redirected, so reading it will not wait on a terminal.
pub fn is_stdin_available() -> bool {
    !io::stdin().is_terminal()
}

pub fn read_commands(path: &Path) -> Result<CommandBatch> {
    match CommandFormat::from_path(path)? {
        CommandFormat::Csv => read_commands_from_csv(path),
        CommandFormat::Json => read_commands_from_json(path),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub format: CommandFormat,
    pub valid_commands: usize,
    pub rejected: usize,
}

/// Load a command file without running it. Fails when the file is unreadable
/// or holds no valid command.
pub fn validate_command_file(path: &Path) -> Result<ValidationReport> {
    let format = CommandFormat::from_path(path)?;
    let batch = read_commands(path)?;
    if batch.commands.is_empty() {
        bail!("{} contains no valid commands", path.display());
    }
    Ok(ValidationReport {
        format,
        valid_commands: batch.commands.len(),
        rejected: batch.rejected,
    })
}

pub fn write_example_csv(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut writer = Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(CSV_COLUMNS)?;
    writer.write_record([
        "add",
        "space = DOCS AND title ~ \"Project\"",
        "documentation,project",
        "false",
        "",
    ])?;
    writer.write_record([
        "remove",
        "space = ARCHIVE",
        "outdated,deprecated",
        "true",
        "label = \"keep\"",
    ])?;
    writer.write_record([
        "replace",
        "space = DOCS AND label = \"old-tag\"",
        "old-tag=new-tag,typo=correct",
        "false",
        "label = \"do-not-modify\"",
    ])?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("created example CSV file at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn csv_row_with_quoted_tags_builds_add_command() {
        let input = "action,cql_expression,tags,interactive,cql_exclude\n\
                     add, space = DOCS,\"tag1,tag2\", false,\n";
        let batch = read_commands_from_csv_reader(input.as_bytes()).expect("csv");
        assert_eq!(batch.commands.len(), 1);

        let command = &batch.commands[0];
        assert_eq!(command.action(), TagAction::Add);
        assert_eq!(command.cql_expression(), "space = DOCS");
        assert_eq!(
            command.tags(),
            Some(&["tag1".to_string(), "tag2".to_string()][..])
        );
        assert!(!command.interactive());
        assert_eq!(command.cql_exclude(), None);
    }

    #[test]
    fn csv_replace_row_drops_malformed_pairs() {
        let input = "action,cql_expression,tags,interactive\n\
                     replace,space = DOCS,\"a=b, broken, c=d=e\",YES\n";
        let batch = read_commands_from_csv_reader(input.as_bytes()).expect("csv");
        let command = &batch.commands[0];
        let mapping = command.tag_mapping().expect("mapping");
        assert_eq!(mapping.old_tags(), vec!["a", "c"]);
        assert_eq!(mapping.get("c"), Some("d=e"));
        assert!(command.interactive());
    }

    #[test]
    fn csv_bad_rows_are_skipped() {
        let input = "action,cql_expression,tags\n\
                     rename,space = DOCS,a\n\
                     add,,a\n\
                     add,space = DOCS,\n\
                     remove,space = DOCS,old\n";
        let batch = read_commands_from_csv_reader(input.as_bytes()).expect("csv");
        assert_eq!(batch.commands.len(), 1);
        assert_eq!(batch.rejected, 3);
        assert_eq!(batch.commands[0].action(), TagAction::Remove);
    }

    #[test]
    fn csv_missing_required_column_is_fatal() {
        let input = "action,cql_expression\nadd,space = DOCS\n";
        let error = read_commands_from_csv_reader(input.as_bytes()).expect_err("must fail");
        assert!(error.to_string().contains("missing required column: tags"));
    }

    #[test]
    fn json_replace_command_has_mapping_only() {
        let batch = parse_commands_json(
            r#"{"commands":[{"action":"replace","cql_expression":"space = DOCS","tags":{"a":"b"}}]}"#,
        )
        .expect("json");
        let command = &batch.commands[0];
        assert_eq!(command.tags(), None);
        let mapping = command.tag_mapping().expect("mapping");
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get("a"), Some("b"));
    }

    #[test]
    fn json_invalid_commands_are_skipped() {
        let batch = parse_commands_json(
            r#"{
                "description": "cleanup",
                "commands": [
                    {"action": "add", "cql_expression": "space = A", "tags": ["x"], "interactive": true},
                    {"action": "add", "cql_expression": "space = A", "tags": {"x": "y"}},
                    {"action": "replace", "cql_expression": "space = A", "tags": ["x"]},
                    {"action": "remove", "tags": ["x"]},
                    {"action": "remove", "cql_expression": "space = B", "tags": ["x"], "cql_exclude": "label = keep"}
                ]
            }"#,
        )
        .expect("json");
        assert_eq!(batch.description.as_deref(), Some("cleanup"));
        assert_eq!(batch.commands.len(), 2);
        assert_eq!(batch.rejected, 3);
        assert!(batch.commands[0].interactive());
        assert_eq!(batch.commands[1].cql_exclude(), Some("label = keep"));
    }

    #[test]
    fn json_regex_commands_compile_patterns() {
        let batch = parse_commands_json(
            r#"{"commands": [
                {"action": "replace", "cql_expression": "id = 7", "tags": {"foo-.*": "replaced-foo"}, "regex": true},
                {"action": "remove", "cql_expression": "id = 7", "tags": ["bar-.*"], "regex": true},
                {"action": "remove", "cql_expression": "id = 7", "tags": ["bar-("], "regex": true},
                {"action": "add", "cql_expression": "id = 7", "tags": ["x"], "regex": true}
            ]}"#,
        )
        .expect("json");
        assert_eq!(batch.commands.len(), 2);
        assert_eq!(batch.rejected, 2);
        assert!(batch.commands.iter().all(|command| command.operation().is_matching()));
        assert_eq!(batch.commands[1].action(), TagAction::Remove);
        assert_eq!(batch.commands[0].tag_mapping(), None);
    }

    #[test]
    fn csv_regex_column_is_optional() {
        let input = "action,cql_expression,tags,regex\n\
                     remove,space = DOCS,\"test-.*,temp-.*\",true\n\
                     remove,space = DOCS,test-.*,\n";
        let batch = read_commands_from_csv_reader(input.as_bytes()).expect("csv");
        assert_eq!(batch.commands.len(), 2);
        assert!(batch.commands[0].operation().is_matching());
        assert_eq!(
            batch.commands[1].tags(),
            Some(&["test-.*".to_string()][..])
        );
    }

    #[test]
    fn json_without_commands_array_is_an_error() {
        assert!(parse_commands_json(r#"{"description": "x"}"#).is_err());
        assert!(parse_commands_json("not json").is_err());
    }

    #[test]
    fn example_csv_validates() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("example.csv");
        write_example_csv(&path).expect("write");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("action,cql_expression,tags,interactive,cql_exclude"));

        let report = validate_command_file(&path).expect("validate");
        assert_eq!(report.format, CommandFormat::Csv);
        assert_eq!(report.valid_commands, 3);
        assert_eq!(report.rejected, 0);
    }

    #[test]
    fn validate_rejects_files_without_valid_commands() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("empty.json");
        fs::write(&path, r#"{"commands": [{"action": "add"}]}"#).expect("write");
        assert!(validate_command_file(&path).is_err());

        let path = temp.path().join("commands.txt");
        fs::write(&path, "x").expect("write");
        assert!(validate_command_file(&path).is_err());
    }
}
