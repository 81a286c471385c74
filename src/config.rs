//! Task description loading: YAML parse, `extends` chain resolution, and
//! validation against the closed configuration schema.
//!
//! The schema is static: every recognized key is enumerated here, unknown or
//! misspelled keys are rejected at parse time, and file-valued positions are
//! checked to hold a path, a wildcard pattern, a tag expression, or a list
//! of those, depending on the field. Nothing touches the filesystem beyond
//! reading the configuration files themselves; path existence and wildcard
//! expansion are the graph compiler's business.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Value;

use crate::error::ConfigError;
use crate::tag::Tag;

pub const TASK_FILE: &str = "task.yaml";

/// A single-file position: a literal path or a tag expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FileRef {
    Path(String),
    Tag(Tag),
}

/// A testcase file position, which additionally allows wildcard patterns.
#[derive(Debug, Clone, PartialEq)]
pub enum FileSpec {
    Path(String),
    Glob(String),
    Tag(Tag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackLevel {
    Restricted,
    Full,
}

impl FeedbackLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackLevel::Restricted => "RESTRICTED",
            FeedbackLevel::Full => "FULL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMode {
    SumSubtaskBest,
    Max,
    MaxTokenedLast,
}

impl ScoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreMode::SumSubtaskBest => "SUM_SUBTASK_BEST",
            ScoreMode::Max => "MAX",
            ScoreMode::MaxTokenedLast => "MAX_TOKENED_LAST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreType {
    GroupMin,
    GroupMul,
    GroupThreshold,
    Sum,
}

impl ScoreType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreType::GroupMin => "GROUP_MIN",
            ScoreType::GroupMul => "GROUP_MUL",
            ScoreType::GroupThreshold => "GROUP_THRESHOLD",
            ScoreType::Sum => "SUM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOptions {
    pub decimal_places: u32,
    pub mode: ScoreMode,
    pub score_type: ScoreType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIo {
    StdIo,
    FifoIo,
}

impl UserIo {
    pub fn as_str(self) -> &'static str {
        match self {
            UserIo::StdIo => "std_io",
            UserIo::FifoIo => "fifo_io",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskType {
    Batch {
        stdin_filename: String,
        stdout_filename: String,
    },
    OutputOnly,
    Communication {
        manager: FileRef,
        num_processes: u32,
        user_io: UserIo,
    },
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Batch { .. } => "BATCH",
            TaskType::OutputOnly => "OUTPUT_ONLY",
            TaskType::Communication { .. } => "COMMUNICATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    Disabled,
    Finite,
    Infinite,
}

impl TokenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenMode::Disabled => "DISABLED",
            TokenMode::Finite => "FINITE",
            TokenMode::Infinite => "INFINITE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tokens {
    pub mode: TokenMode,
    pub initial: u32,
    pub gen_number: u32,
}

impl Default for Tokens {
    fn default() -> Self {
        Tokens {
            mode: TokenMode::Disabled,
            initial: 2,
            gen_number: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CppOptions {
    pub gcc_args: String,
}

impl Default for CppOptions {
    fn default() -> Self {
        CppOptions {
            gcc_args: "-O2 -std=gnu++11 -static -s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatexOptions {
    pub latexmk_args: String,
    pub additional_files: Vec<FileRef>,
}

impl Default for LatexOptions {
    fn default() -> Self {
        LatexOptions {
            latexmk_args: "latexmk -latexoption=-interaction=nonstopmode -pdf".to_string(),
            additional_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestcaseSpec {
    pub input: FileSpec,
    pub output: Option<FileSpec>,
    pub public: bool,
    pub codename: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subtask {
    pub points: f64,
    pub public: bool,
    pub testcases: Vec<TestcaseSpec>,
}

/// The merged, validated task configuration.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub name: String,
    pub long_name: String,
    pub author: Option<String>,
    pub attribution: Option<String>,
    pub uses: Vec<String>,
    pub statements: BTreeMap<String, FileRef>,
    pub statement_html: Option<FileRef>,
    pub default_input: Option<FileRef>,
    pub attachments: BTreeMap<String, FileRef>,
    pub feedback_level: FeedbackLevel,
    pub score_options: ScoreOptions,
    /// Seconds.
    pub time_limit: f64,
    /// MiB.
    pub memory_limit: f64,
    pub sample_solution: Option<FileRef>,
    pub grader: Vec<FileRef>,
    pub task_type: TaskType,
    pub subtasks: Vec<Subtask>,
    pub checker: Option<FileRef>,
    pub testcase_checker: Option<FileRef>,
    pub test_submissions: BTreeMap<String, f64>,
    pub editor_templates: Vec<FileRef>,
    pub test_grader: Vec<FileRef>,
    pub tokens: Tokens,
    pub cpp: CppOptions,
    pub latex: LatexOptions,
}

/// Load `<task_root>/task.yaml`, resolve its `extends` chain and validate.
pub fn load(task_root: &Utf8Path) -> Result<TaskConfig, ConfigError> {
    let path = task_root.join(TASK_FILE);
    let value = load_with_extends(&path, &mut Vec::new())?;
    parse(value)
}

fn load_yaml(path: &Utf8Path) -> Result<Value, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_owned(),
        source,
    })
}

fn load_with_extends(
    path: &Utf8Path,
    seen: &mut Vec<Utf8PathBuf>,
) -> Result<Value, ConfigError> {
    let canon = path
        .canonicalize_utf8()
        .map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
    if seen.contains(&canon) {
        return Err(ConfigError::ExtendsCycle { path: canon });
    }
    seen.push(canon);

    let mut value = load_yaml(path)?;

    let extends_key = Value::from("extends");
    let parent_ref = match &mut value {
        Value::Mapping(map) => match map.remove(&extends_key) {
            Some(Value::String(parent)) => Some(parent),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    field: "extends".to_string(),
                    reason: format!("expected a path string, got {other:?}"),
                });
            }
            None => None,
        },
        _ => None,
    };

    if let Some(parent_ref) = parent_ref {
        let base = path.parent().unwrap_or(Utf8Path::new("."));
        let parent = load_with_extends(&base.join(parent_ref), seen)?;
        value = merge(value, parent);
    }

    Ok(value)
}

/// Merge a child configuration over its parent. Mappings merge key by key,
/// an explicit `null` in the child inherits the parent's value, and every
/// other child value (scalars *and* lists) replaces the parent's wholesale.
fn merge(child: Value, parent: Value) -> Value {
    match (child, parent) {
        (Value::Mapping(mut child), Value::Mapping(parent)) => {
            for (key, parent_value) in parent {
                match child.remove(&key) {
                    Some(child_value) => {
                        child.insert(key, merge(child_value, parent_value));
                    }
                    None => {
                        child.insert(key, parent_value);
                    }
                }
            }
            Value::Mapping(child)
        }
        (Value::Null, parent) => parent,
        (child, _) => child,
    }
}

// ******************************
// *        Schema walk         *
// ******************************

/// A mapping being consumed key by key; whatever is left over when the walk
/// finishes is an unknown key and rejects the configuration.
struct Fields {
    at: String,
    entries: Vec<(String, Value)>,
}

impl Fields {
    fn new(value: Value, at: &str) -> Result<Self, ConfigError> {
        let entries = match value {
            Value::Mapping(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    match key {
                        Value::String(key) => entries.push((key, value)),
                        other => {
                            return Err(ConfigError::Invalid {
                                field: at.to_string(),
                                reason: format!("mapping keys must be strings, got {other:?}"),
                            });
                        }
                    }
                }
                entries
            }
            Value::Null => Vec::new(),
            other => {
                return Err(ConfigError::Invalid {
                    field: at.to_string(),
                    reason: format!("expected a mapping, got {other:?}"),
                });
            }
        };

        Ok(Fields {
            at: at.to_string(),
            entries,
        })
    }

    fn label(&self) -> &str {
        if self.at.is_empty() { TASK_FILE } else { &self.at }
    }

    fn path(&self, key: &str) -> String {
        if self.at.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.at)
        }
    }

    fn take(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    fn required(&mut self, key: &str) -> Result<Value, ConfigError> {
        self.take(key).ok_or_else(|| ConfigError::MissingKey {
            field: self.label().to_string(),
            key: key.to_string(),
        })
    }

    fn finish(self) -> Result<(), ConfigError> {
        let field = self.label().to_string();
        match self.entries.into_iter().next() {
            Some((key, _)) => Err(ConfigError::UnknownKey { field, key }),
            None => Ok(()),
        }
    }
}

fn expect_str(value: Value, field: &str) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("expected a string, got {other:?}"),
        }),
    }
}

fn expect_f64(value: Value, field: &str) -> Result<f64, ConfigError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("{n} is not representable as a float"),
        }),
        other => Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("expected a number, got {other:?}"),
        }),
    }
}

fn expect_u32(value: Value, field: &str) -> Result<u32, ConfigError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ConfigError::Invalid {
                field: field.to_string(),
                reason: format!("{n} is not a small non-negative integer"),
            }),
        other => Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("expected an integer, got {other:?}"),
        }),
    }
}

fn expect_bool(value: Value, field: &str) -> Result<bool, ConfigError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}

/// Parse a unit-suffixed scalar such as `"2.5s"` or `"256MiB"`. Bare numbers
/// are rejected so the unit is always explicit in the configuration.
fn expect_unit(value: Value, unit: &str, field: &str) -> Result<f64, ConfigError> {
    let text = match value {
        Value::String(s) => s,
        other => {
            return Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: format!("{other:?} needs a unit, write e.g. `1{unit}`"),
            });
        }
    };
    let number = text
        .strip_suffix(unit)
        .ok_or_else(|| ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("`{text}` must end with unit {unit}"),
        })?;
    number
        .trim()
        .parse::<f64>()
        .map_err(|_| ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("`{text}` is not a number with unit {unit}"),
        })
}

fn one_of<'a>(value: Value, options: &[&'a str], field: &str) -> Result<&'a str, ConfigError> {
    let text = expect_str(value, field)?;
    options
        .iter()
        .find(|&&option| option == text)
        .copied()
        .ok_or_else(|| ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("`{text}` is not one of {}", options.join(", ")),
        })
}

fn expect_string_list(value: Value, field: &str) -> Result<Vec<String>, ConfigError> {
    match value {
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| expect_str(item, field))
            .collect(),
        other => Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("expected a list of strings, got {other:?}"),
        }),
    }
}

impl FileRef {
    pub(crate) fn from_value(value: Value, field: &str) -> Result<Self, ConfigError> {
        match value {
            Value::String(path) if !path.is_empty() => Ok(FileRef::Path(path)),
            Value::Tagged(tagged) => Ok(FileRef::Tag(Tag::from_tagged(
                &tagged.tag.to_string(),
                &tagged.value,
                field,
            )?)),
            other => Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: format!("expected a file path or a tag expression, got {other:?}"),
            }),
        }
    }
}

fn is_glob(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

impl FileSpec {
    pub(crate) fn from_value(value: Value, field: &str) -> Result<Self, ConfigError> {
        match value {
            Value::String(text) if !text.is_empty() => {
                if is_glob(&text) {
                    Ok(FileSpec::Glob(text))
                } else {
                    Ok(FileSpec::Path(text))
                }
            }
            Value::Tagged(tagged) => Ok(FileSpec::Tag(Tag::from_tagged(
                &tagged.tag.to_string(),
                &tagged.value,
                field,
            )?)),
            other => Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: format!(
                    "expected a file path, wildcard pattern or tag expression, got {other:?}"
                ),
            }),
        }
    }
}

fn file_map(value: Value, field: &str) -> Result<BTreeMap<String, FileRef>, ConfigError> {
    let entries = Fields::new(value, field)?.entries;
    let mut map = BTreeMap::new();
    for (key, value) in entries {
        let at = format!("{field}.{key}");
        map.insert(key, FileRef::from_value(value, &at)?);
    }
    Ok(map)
}

fn file_list(value: Value, field: &str) -> Result<Vec<FileRef>, ConfigError> {
    match value {
        Value::Sequence(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| FileRef::from_value(item, &format!("{field}[{i}]")))
            .collect(),
        other => Err(ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("expected a list of files, got {other:?}"),
        }),
    }
}

fn parse_score_options(value: Value) -> Result<ScoreOptions, ConfigError> {
    let mut fields = Fields::new(value, "score_options")?;

    let decimal_places = match fields.take("decimal_places") {
        Some(v) => expect_u32(v, &fields.path("decimal_places"))?,
        None => 0,
    };
    let mode = match fields.take("mode") {
        Some(v) => match one_of(
            v,
            &["SUM_SUBTASK_BEST", "MAX", "MAX_TOKENED_LAST"],
            &fields.path("mode"),
        )? {
            "MAX" => ScoreMode::Max,
            "MAX_TOKENED_LAST" => ScoreMode::MaxTokenedLast,
            _ => ScoreMode::SumSubtaskBest,
        },
        None => ScoreMode::SumSubtaskBest,
    };
    let score_type = match fields.take("type") {
        Some(v) => match one_of(
            v,
            &["GROUP_MIN", "GROUP_MUL", "GROUP_THRESHOLD", "SUM"],
            &fields.path("type"),
        )? {
            "GROUP_MUL" => ScoreType::GroupMul,
            "GROUP_THRESHOLD" => ScoreType::GroupThreshold,
            "SUM" => ScoreType::Sum,
            _ => ScoreType::GroupMin,
        },
        None => ScoreType::GroupMin,
    };

    fields.finish()?;
    Ok(ScoreOptions {
        decimal_places,
        mode,
        score_type,
    })
}

fn parse_task_type(value: Value) -> Result<TaskType, ConfigError> {
    match value {
        Value::String(s) => match s.as_str() {
            "BATCH" => Ok(TaskType::Batch {
                stdin_filename: String::new(),
                stdout_filename: String::new(),
            }),
            "OUTPUT_ONLY" => Ok(TaskType::OutputOnly),
            other => Err(ConfigError::Invalid {
                field: "task_type".to_string(),
                reason: format!(
                    "`{other}` is not a valid task type, use BATCH, OUTPUT_ONLY or a mapping"
                ),
            }),
        },
        value => {
            let mut fields = Fields::new(value, "task_type")?;
            let kind = one_of(
                fields.required("type")?,
                &["BATCH", "OUTPUT_ONLY", "COMMUNICATION"],
                &fields.path("type"),
            )?;
            let task_type = match kind {
                "BATCH" => TaskType::Batch {
                    stdin_filename: match fields.take("stdin_filename") {
                        Some(v) => expect_str(v, &fields.path("stdin_filename"))?,
                        None => String::new(),
                    },
                    stdout_filename: match fields.take("stdout_filename") {
                        Some(v) => expect_str(v, &fields.path("stdout_filename"))?,
                        None => String::new(),
                    },
                },
                "OUTPUT_ONLY" => TaskType::OutputOnly,
                _ => TaskType::Communication {
                    manager: FileRef::from_value(
                        fields.required("manager")?,
                        &fields.path("manager"),
                    )?,
                    num_processes: match fields.take("num_processes") {
                        Some(v) => expect_u32(v, &fields.path("num_processes"))?,
                        None => 1,
                    },
                    user_io: match fields.take("user_io") {
                        Some(v) => {
                            match one_of(v, &["std_io", "fifo_io"], &fields.path("user_io"))? {
                                "fifo_io" => UserIo::FifoIo,
                                _ => UserIo::StdIo,
                            }
                        }
                        None => UserIo::StdIo,
                    },
                },
            };
            fields.finish()?;
            Ok(task_type)
        }
    }
}

fn parse_tokens(value: Value) -> Result<Tokens, ConfigError> {
    let mut fields = Fields::new(value, "tokens")?;
    let mode = match fields.take("mode") {
        Some(v) => match one_of(v, &["DISABLED", "FINITE", "INFINITE"], &fields.path("mode"))? {
            "FINITE" => TokenMode::Finite,
            "INFINITE" => TokenMode::Infinite,
            _ => TokenMode::Disabled,
        },
        None => TokenMode::Disabled,
    };
    let initial = match fields.take("initial") {
        Some(v) => expect_u32(v, &fields.path("initial"))?,
        None => 2,
    };
    let gen_number = match fields.take("gen_number") {
        Some(v) => expect_u32(v, &fields.path("gen_number"))?,
        None => 2,
    };
    fields.finish()?;
    Ok(Tokens {
        mode,
        initial,
        gen_number,
    })
}

fn parse_subtasks(value: Value) -> Result<Vec<Subtask>, ConfigError> {
    let items = match value {
        Value::Sequence(items) => items,
        other => {
            return Err(ConfigError::Invalid {
                field: "subtasks".to_string(),
                reason: format!("expected a list of subtasks, got {other:?}"),
            });
        }
    };

    let mut subtasks = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let at = format!("subtasks[{i}]");
        let mut fields = Fields::new(item, &at)?;

        let points = expect_f64(fields.required("points")?, &fields.path("points"))?;
        let public = match fields.take("public") {
            Some(v) => expect_bool(v, &fields.path("public"))?,
            None => true,
        };

        let testcase_items = match fields.required("testcases")? {
            Value::Sequence(items) => items,
            other => {
                return Err(ConfigError::Invalid {
                    field: fields.path("testcases"),
                    reason: format!("expected a list of testcases, got {other:?}"),
                });
            }
        };

        let mut testcases = Vec::with_capacity(testcase_items.len());
        for (j, item) in testcase_items.into_iter().enumerate() {
            let at = format!("{at}.testcases[{j}]");
            let mut fields = Fields::new(item, &at)?;

            let input = FileSpec::from_value(fields.required("input")?, &fields.path("input"))?;
            let output = match fields.take("output") {
                Some(v) => Some(FileSpec::from_value(v, &fields.path("output"))?),
                None => None,
            };
            let tc_public = match fields.take("public") {
                Some(v) => expect_bool(v, &fields.path("public"))?,
                None => public,
            };
            let codename = match fields.take("codename") {
                Some(v) => Some(expect_str(v, &fields.path("codename"))?),
                None => None,
            };

            fields.finish()?;
            testcases.push(TestcaseSpec {
                input,
                output,
                public: tc_public,
                codename,
            });
        }

        fields.finish()?;
        subtasks.push(Subtask {
            points,
            public,
            testcases,
        });
    }

    Ok(subtasks)
}

fn parse(value: Value) -> Result<TaskConfig, ConfigError> {
    let mut fields = Fields::new(value, "")?;

    let name = expect_str(fields.required("name")?, "name")?;
    let long_name = expect_str(fields.required("long_name")?, "long_name")?;
    let author = match fields.take("author") {
        Some(v) => Some(expect_str(v, "author")?),
        None => None,
    };
    let attribution = match fields.take("attribution") {
        Some(v) => Some(expect_str(v, "attribution")?),
        None => None,
    };
    let uses = match fields.take("uses") {
        Some(v) => expect_string_list(v, "uses")?,
        None => Vec::new(),
    };

    let statements = file_map(fields.required("statements")?, "statements")?;
    let statement_html = match fields.take("statement_html") {
        Some(v) => Some(FileRef::from_value(v, "statement_html")?),
        None => None,
    };
    let default_input = match fields.take("default_input") {
        Some(v) => Some(FileRef::from_value(v, "default_input")?),
        None => None,
    };
    let attachments = match fields.take("attachments") {
        Some(v) => file_map(v, "attachments")?,
        None => BTreeMap::new(),
    };

    let feedback_level = match fields.take("feedback_level") {
        Some(v) => match one_of(v, &["RESTRICTED", "FULL"], "feedback_level")? {
            "FULL" => FeedbackLevel::Full,
            _ => FeedbackLevel::Restricted,
        },
        None => FeedbackLevel::Restricted,
    };

    let score_options = parse_score_options(fields.required("score_options")?)?;
    let time_limit = expect_unit(fields.required("time_limit")?, "s", "time_limit")?;
    let memory_limit = expect_unit(fields.required("memory_limit")?, "MiB", "memory_limit")?;

    let sample_solution = match fields.take("sample_solution") {
        Some(v) => Some(FileRef::from_value(v, "sample_solution")?),
        None => None,
    };
    let grader = match fields.take("grader") {
        Some(v) => file_list(v, "grader")?,
        None => Vec::new(),
    };

    let task_type = parse_task_type(fields.required("task_type")?)?;
    let subtasks = parse_subtasks(fields.required("subtasks")?)?;

    let checker = match fields.take("checker") {
        Some(v) => Some(FileRef::from_value(v, "checker")?),
        None => None,
    };
    let testcase_checker = match fields.take("testcase_checker") {
        Some(v) => Some(FileRef::from_value(v, "testcase_checker")?),
        None => None,
    };

    let test_submissions = match fields.take("test_submissions") {
        Some(v) => {
            let entries = Fields::new(v, "test_submissions")?.entries;
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                let at = format!("test_submissions.{key}");
                map.insert(key, expect_f64(value, &at)?);
            }
            map
        }
        None => BTreeMap::new(),
    };

    let editor_templates = match fields.take("editor_templates") {
        Some(v) => file_list(v, "editor_templates")?,
        None => Vec::new(),
    };
    let test_grader = match fields.take("test_grader") {
        Some(v) => file_list(v, "test_grader")?,
        None => Vec::new(),
    };

    let tokens = match fields.take("tokens") {
        Some(v) => parse_tokens(v)?,
        None => Tokens::default(),
    };

    let cpp = match fields.take("cpp_config") {
        Some(v) => {
            let mut fields = Fields::new(v, "cpp_config")?;
            let gcc_args = match fields.take("gcc_args") {
                Some(v) => expect_str(v, &fields.path("gcc_args"))?,
                None => CppOptions::default().gcc_args,
            };
            fields.finish()?;
            CppOptions { gcc_args }
        }
        None => CppOptions::default(),
    };

    let latex = match fields.take("latex_config") {
        Some(v) => {
            let mut fields = Fields::new(v, "latex_config")?;
            let latexmk_args = match fields.take("latexmk_args") {
                Some(v) => expect_str(v, &fields.path("latexmk_args"))?,
                None => LatexOptions::default().latexmk_args,
            };
            let additional_files = match fields.take("additional_files") {
                Some(v) => file_list(v, &fields.path("additional_files"))?,
                None => Vec::new(),
            };
            fields.finish()?;
            LatexOptions {
                latexmk_args,
                additional_files,
            }
        }
        None => LatexOptions::default(),
    };

    fields.finish()?;

    Ok(TaskConfig {
        name,
        long_name,
        author,
        attribution,
        uses,
        statements,
        statement_html,
        default_input,
        attachments,
        feedback_level,
        score_options,
        time_limit,
        memory_limit,
        sample_solution,
        grader,
        task_type,
        subtasks,
        checker,
        testcase_checker,
        test_submissions,
        editor_templates,
        test_grader,
        tokens,
        cpp,
        latex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagKind;

    const MINIMAL: &str = "\
name: sum
long_name: Addition
statements:
  en: !raw statement
score_options: {}
time_limit: 1.0s
memory_limit: 256MiB
task_type: BATCH
subtasks:
  - points: 100
    testcases:
      - input: !raw '1 2'
";

    fn write_task(dir: &Utf8Path, text: &str) {
        fs::write(dir.join(TASK_FILE), text).unwrap();
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let (_guard, root) = scratch();
        write_task(&root, MINIMAL);

        let config = load(&root).unwrap();
        assert_eq!(config.name, "sum");
        assert_eq!(config.feedback_level, FeedbackLevel::Restricted);
        assert_eq!(config.score_options.mode, ScoreMode::SumSubtaskBest);
        assert_eq!(config.score_options.score_type, ScoreType::GroupMin);
        assert_eq!(config.time_limit, 1.0);
        assert_eq!(config.memory_limit, 256.0);
        assert!(matches!(config.task_type, TaskType::Batch { .. }));
        assert!(config.subtasks[0].public);
        assert!(config.subtasks[0].testcases[0].public);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let (_guard, root) = scratch();
        write_task(&root, &format!("{MINIMAL}time_limt: 2.0s\n"));

        let err = load(&root).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { key, .. } if key == "time_limt"));
    }

    #[test]
    fn bare_numbers_need_units() {
        let (_guard, root) = scratch();
        write_task(&root, &MINIMAL.replace("time_limit: 1.0s", "time_limit: 1.0"));

        let err = load(&root).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "time_limit"));
    }

    #[test]
    fn glob_and_path_specs_are_classified() {
        let (_guard, root) = scratch();
        write_task(
            &root,
            &MINIMAL.replace(
                "      - input: !raw '1 2'",
                "      - input: tc/1-*.in\n        output: tc/1-01.out",
            ),
        );

        let config = load(&root).unwrap();
        let tc = &config.subtasks[0].testcases[0];
        assert_eq!(tc.input, FileSpec::Glob("tc/1-*.in".into()));
        assert_eq!(tc.output, Some(FileSpec::Path("tc/1-01.out".into())));
    }

    #[test]
    fn tags_parse_in_file_positions() {
        let (_guard, root) = scratch();
        write_task(
            &root,
            &MINIMAL.replace("en: !raw statement", "en: !latexcompile statement/en.tex"),
        );

        let config = load(&root).unwrap();
        match &config.statements["en"] {
            FileRef::Tag(tag) => assert_eq!(tag.kind, TagKind::LatexCompile),
            other => panic!("expected tag, got {other:?}"),
        }
    }

    #[test]
    fn extends_overrides_inherits_and_replaces_lists() {
        let (_guard, root) = scratch();
        fs::write(
            root.join("base.yaml"),
            "\
name: base
long_name: Base task
statements:
  en: !raw statement
score_options:
  decimal_places: 2
time_limit: 3.0s
memory_limit: 512MiB
task_type: BATCH
subtasks:
  - points: 30
    testcases:
      - input: !raw 'a'
  - points: 70
    testcases:
      - input: !raw 'b'
",
        )
        .unwrap();
        write_task(
            &root,
            "\
extends: base.yaml
name: child
time_limit: 1.5s
score_options:
  mode: MAX
subtasks:
  - points: 100
    testcases:
      - input: !raw 'c'
",
        );

        let config = load(&root).unwrap();
        // Scalar present in the child wins, absent scalars inherit.
        assert_eq!(config.name, "child");
        assert_eq!(config.long_name, "Base task");
        assert_eq!(config.time_limit, 1.5);
        assert_eq!(config.memory_limit, 512.0);
        // Nested mappings merge field by field.
        assert_eq!(config.score_options.decimal_places, 2);
        assert_eq!(config.score_options.mode, ScoreMode::Max);
        // Lists are replaced wholesale, never concatenated or zipped.
        assert_eq!(config.subtasks.len(), 1);
        assert_eq!(config.subtasks[0].points, 100.0);
    }

    #[test]
    fn extends_cycle_is_detected() {
        let (_guard, root) = scratch();
        write_task(&root, "extends: other.yaml\nname: a\n");
        fs::write(root.join("other.yaml"), format!("extends: {TASK_FILE}\n")).unwrap();

        let err = load(&root).unwrap_err();
        assert!(matches!(err, ConfigError::ExtendsCycle { .. }));
    }

    #[test]
    fn communication_task_type_parses() {
        let (_guard, root) = scratch();
        write_task(
            &root,
            &MINIMAL.replace(
                "task_type: BATCH",
                "task_type:\n  type: COMMUNICATION\n  manager: !cppcompile manager.cpp\n  num_processes: 2",
            ),
        );

        let config = load(&root).unwrap();
        match config.task_type {
            TaskType::Communication {
                num_processes,
                user_io,
                ..
            } => {
                assert_eq!(num_processes, 2);
                assert_eq!(user_io, UserIo::StdIo);
            }
            other => panic!("expected communication, got {other:?}"),
        }
    }
}
