#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod core;
mod error;
mod exec;
mod graph;
mod io;
mod materialize;
mod tag;
mod upload;

use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;

pub use crate::config::{
    CppOptions, FeedbackLevel, FileRef, FileSpec, LatexOptions, ScoreMode, ScoreOptions,
    ScoreType, Subtask, TaskConfig, TaskType, TestcaseSpec, TokenMode, Tokens, UserIo,
};
pub use crate::error::{
    ActionError, BuildFailed, ConfigError, GraphError, NodeFailure, TaskmillError, UploadError,
};
pub use crate::tag::{Tag, TagArg, TagKind};
pub use crate::upload::{
    CommandService, ContestService, RemoteTaskId, SubmissionOutcome, UploadReport,
};

use crate::cache::CacheStore;

/// Name of the per-task state directory holding cache, intermediate build
/// outputs and the materialized result tree.
pub const INTERNAL_DIR: &str = ".taskmill";

pub(crate) fn internal_dir(root: &Utf8Path) -> Utf8PathBuf {
    root.join(INTERNAL_DIR)
}

pub(crate) fn build_dir(root: &Utf8Path) -> Utf8PathBuf {
    internal_dir(root).join("build")
}

pub(crate) fn cache_dir(root: &Utf8Path) -> Utf8PathBuf {
    internal_dir(root).join("cache")
}

pub(crate) fn result_dir(root: &Utf8Path) -> Utf8PathBuf {
    internal_dir(root).join("result")
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Worker pool size; `0` means available parallelism.
    pub workers: usize,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub task: String,
    pub result_dir: Utf8PathBuf,
    /// Nodes whose action ran this time.
    pub executed: usize,
    /// Nodes satisfied from the cache.
    pub cached: usize,
}

fn io_err(task: &str) -> impl FnOnce(std::io::Error) -> TaskmillError + '_ {
    move |source| TaskmillError::Io {
        task: task.to_string(),
        source,
    }
}

/// Build one task directory: load and validate the configuration, compile
/// the build graph, execute it against the cache, and materialize the
/// result tree.
pub fn build_task(
    task_dir: &Utf8Path,
    options: &BuildOptions,
) -> Result<BuildOutcome, TaskmillError> {
    let (_, _, outcome) = build_inner(task_dir, options)?;
    Ok(outcome)
}

fn build_inner(
    task_dir: &Utf8Path,
    options: &BuildOptions,
) -> Result<(TaskConfig, Utf8PathBuf, BuildOutcome), TaskmillError> {
    let label = task_dir.to_string();
    let root = task_dir
        .canonicalize_utf8()
        .map_err(io_err(&label))?;

    let s = Instant::now();
    let config = config::load(&root).map_err(|source| TaskmillError::Config {
        task: label.clone(),
        source,
    })?;
    let task = config.name.clone();

    let plan = graph::compile(&config, &root).map_err(|source| TaskmillError::Graph {
        task: task.clone(),
        source,
    })?;
    eprintln!(
        "Compiled {} build nodes for {} {}",
        plan.graph.node_count(),
        style(&task).red(),
        io::as_overhead(s)
    );

    let s = Instant::now();
    let mut cache = CacheStore::open(&cache_dir(&root)).map_err(io_err(&task))?;
    let report = exec::execute(&plan, &mut cache, options.workers).map_err(io_err(&task))?;
    cache.flush().map_err(io_err(&task))?;

    if !report.failures.is_empty() {
        return Err(TaskmillError::Build {
            task,
            source: BuildFailed {
                failures: report.failures,
            },
        });
    }

    let result_dir = materialize::materialize(&config, &plan).map_err(io_err(&task))?;
    eprintln!(
        "Finished {}: {} built, {} cached {}",
        style(&task).red(),
        report.executed,
        report.cached,
        io::as_overhead(s)
    );

    let outcome = BuildOutcome {
        task,
        result_dir,
        executed: report.executed,
        cached: report.cached,
    };
    Ok((config, root, outcome))
}

/// Build the task, then create or update it on the contest service and
/// verify the declared test submissions.
pub fn upload_task(
    task_dir: &Utf8Path,
    options: &BuildOptions,
    service: &mut dyn ContestService,
    run_tests: bool,
) -> Result<(BuildOutcome, UploadReport), TaskmillError> {
    let (config, root, outcome) = build_inner(task_dir, options)?;

    let report = upload::upload(&config, &root, &outcome.result_dir, service, run_tests)
        .map_err(|source| TaskmillError::Upload {
            task: outcome.task.clone(),
            source,
        })?;

    Ok((outcome, report))
}

/// Drop the cache and result tree of a task directory.
pub fn clean_task(task_dir: &Utf8Path) -> Result<(), TaskmillError> {
    let label = task_dir.to_string();
    let dir = internal_dir(task_dir);
    if dir.is_dir() {
        io::remove_tree(&dir).map_err(io_err(&label))?;
        eprintln!("Removed {dir}");
    } else {
        eprintln!("Nothing to clean in {task_dir}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn build_clean_rebuild_cycle() {
        let (_guard, root) = scratch();
        fs::create_dir(root.join("tc")).unwrap();
        fs::write(root.join("tc/1-01.in"), "1 2\n").unwrap();
        fs::write(root.join("tc/1-01.out"), "3\n").unwrap();
        fs::write(root.join("tc/1-02.in"), "4 5\n").unwrap();
        fs::write(root.join("tc/1-02.out"), "9\n").unwrap();
        fs::write(
            root.join("task.yaml"),
            "\
name: sum
long_name: Addition
statements:
  en: !raw the statement
score_options: {}
time_limit: 1.0s
memory_limit: 256MiB
task_type: BATCH
subtasks:
  - points: 100
    testcases:
      - input: tc/1-*.in
        output: tc/1-*.out
",
        )
        .unwrap();

        let options = BuildOptions::default();
        let first = build_task(&root, &options).unwrap();
        assert_eq!(first.task, "sum");
        assert!(first.result_dir.join("task.json").is_file());
        assert_eq!(
            fs::read(first.result_dir.join("testcases/1-02.in")).unwrap(),
            b"4 5\n"
        );

        // Nothing changed: the rebuild runs zero actions.
        let second = build_task(&root, &options).unwrap();
        assert_eq!(second.executed, 0);
        assert_eq!(second.cached, first.executed + first.cached);

        clean_task(&root).unwrap();
        assert!(!internal_dir(&root).exists());

        // After a clean everything builds again from scratch.
        let third = build_task(&root, &options).unwrap();
        assert_eq!(third.cached, 0);
    }

    #[test]
    fn config_errors_carry_the_task_label() {
        let (_guard, root) = scratch();
        fs::write(root.join("task.yaml"), "name: broken\n").unwrap();

        let err = build_task(&root, &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, TaskmillError::Config { .. }));
        assert!(err.to_string().contains("task "));
    }
}
