//! The result materializer: after the graph has completed, every artifact
//! with a logical role is linked or copied into a stable directory tree
//! shaped the way the upload collaborator expects. A `task.json` manifest
//! carries the scalar metadata, making the result directory a
//! self-contained handoff; the materializer itself never touches the
//! network.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::config::{TaskConfig, TaskType};
use crate::graph::{BuildPlan, Role};
use crate::io::{link_or_copy, remove_tree, write_atomic};

#[derive(Serialize)]
struct ScoreManifest {
    decimal_places: u32,
    mode: &'static str,
    #[serde(rename = "type")]
    score_type: &'static str,
}

#[derive(Serialize)]
struct TaskTypeManifest {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_processes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_io: Option<&'static str>,
}

#[derive(Serialize)]
struct TokensManifest {
    mode: &'static str,
    initial: u32,
    gen_number: u32,
}

#[derive(Serialize)]
struct TestcaseManifest {
    codename: String,
    public: bool,
}

#[derive(Serialize)]
struct SubtaskManifest {
    points: f64,
    public: bool,
    testcases: Vec<TestcaseManifest>,
}

#[derive(Serialize)]
struct SubmissionManifest {
    file: String,
    expected_score: f64,
}

/// Scalar task metadata written next to the artifacts, consumed by the
/// upload collaborator.
#[derive(Serialize)]
struct TaskManifest<'a> {
    name: &'a str,
    long_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attribution: Option<&'a str>,
    uses: &'a [String],
    feedback_level: &'static str,
    score_options: ScoreManifest,
    time_limit: f64,
    memory_limit: f64,
    task_type: TaskTypeManifest,
    tokens: TokensManifest,
    subtasks: Vec<SubtaskManifest>,
    test_submissions: Vec<SubmissionManifest>,
}

/// Populate `<task root>/.taskmill/result` from the finished plan and
/// return its path. The tree is rebuilt from scratch on every call so stale
/// artifacts from earlier configurations cannot linger.
pub(crate) fn materialize(
    config: &TaskConfig,
    plan: &BuildPlan,
) -> std::io::Result<Utf8PathBuf> {
    let result_dir = crate::result_dir(&plan.root);
    remove_tree(&result_dir)?;
    fs::create_dir_all(&result_dir)?;

    for deliverable in &plan.deliverables {
        let dst = result_dir.join(role_path(&deliverable.role));
        link_or_copy(plan.path_of(deliverable.source), &dst)?;
    }

    for subtask in &plan.subtasks {
        for tc in &subtask.testcases {
            let input = result_dir.join(format!("testcases/{}.in", tc.codename));
            let output = result_dir.join(format!("testcases/{}.out", tc.codename));
            link_or_copy(plan.path_of(tc.input), &input)?;
            link_or_copy(plan.path_of(tc.output), &output)?;
        }
    }

    let manifest = manifest(config, plan);
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    write_atomic(&result_dir.join("task.json"), &bytes)?;

    Ok(result_dir)
}

fn role_path(role: &Role) -> Utf8PathBuf {
    match role {
        Role::Statement(lang) => Utf8PathBuf::from(format!("statements/{lang}.pdf")),
        Role::StatementHtml => Utf8PathBuf::from("statements/statement.html"),
        Role::DefaultInput => Utf8PathBuf::from("default_input.txt"),
        Role::Attachment(name) => Utf8PathBuf::from(format!("attachments/{name}")),
        Role::Grader(name) => Utf8PathBuf::from(format!("graders/{name}")),
        Role::Checker => Utf8PathBuf::from("checker"),
        Role::Manager => Utf8PathBuf::from("manager"),
        Role::SampleSolution => Utf8PathBuf::from("samplesol"),
        Role::EditorTemplate(name) => Utf8PathBuf::from(format!("templates/{name}")),
        Role::TestGrader(name) => Utf8PathBuf::from(format!("test_graders/{name}")),
        Role::TestSubmission(name) => Utf8PathBuf::from(format!("test_submissions/{name}")),
    }
}

fn manifest<'a>(config: &'a TaskConfig, plan: &BuildPlan) -> TaskManifest<'a> {
    let task_type = match &config.task_type {
        TaskType::Batch {
            stdin_filename,
            stdout_filename,
        } => TaskTypeManifest {
            kind: "BATCH",
            stdin_filename: Some(stdin_filename.clone()),
            stdout_filename: Some(stdout_filename.clone()),
            num_processes: None,
            user_io: None,
        },
        TaskType::OutputOnly => TaskTypeManifest {
            kind: "OUTPUT_ONLY",
            stdin_filename: None,
            stdout_filename: None,
            num_processes: None,
            user_io: None,
        },
        TaskType::Communication {
            num_processes,
            user_io,
            ..
        } => TaskTypeManifest {
            kind: "COMMUNICATION",
            stdin_filename: None,
            stdout_filename: None,
            num_processes: Some(*num_processes),
            user_io: Some(user_io.as_str()),
        },
    };

    let subtasks = plan
        .subtasks
        .iter()
        .map(|subtask| SubtaskManifest {
            points: subtask.points,
            public: subtask.public,
            testcases: subtask
                .testcases
                .iter()
                .map(|tc| TestcaseManifest {
                    codename: tc.codename.clone(),
                    public: tc.public,
                })
                .collect(),
        })
        .collect();

    let test_submissions = config
        .test_submissions
        .iter()
        .map(|(file, &expected_score)| SubmissionManifest {
            file: file_name(file),
            expected_score,
        })
        .collect();

    TaskManifest {
        name: &config.name,
        long_name: &config.long_name,
        author: config.author.as_deref(),
        attribution: config.attribution.as_deref(),
        uses: &config.uses,
        feedback_level: config.feedback_level.as_str(),
        score_options: ScoreManifest {
            decimal_places: config.score_options.decimal_places,
            mode: config.score_options.mode.as_str(),
            score_type: config.score_options.score_type.as_str(),
        },
        time_limit: config.time_limit,
        memory_limit: config.memory_limit,
        task_type,
        tokens: TokensManifest {
            mode: config.tokens.mode.as_str(),
            initial: config.tokens.initial,
            gen_number: config.tokens.gen_number,
        },
        subtasks,
        test_submissions,
    }
}

fn file_name(path: &str) -> String {
    Utf8Path::new(path)
        .file_name()
        .unwrap_or(path)
        .to_string()
}
