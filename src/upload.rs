//! The boundary to the contest-management service.
//!
//! The engine's side of the contract is small: it hands over the task
//! metadata and the materialized result directory, and gets back a remote
//! task id plus one observed score per test submission. Everything about
//! the wire protocol lives behind [`ContestService`]. The shipped
//! implementation, [`CommandService`], delegates each operation to an
//! operator-configured external command that reads one JSON request on
//! stdin and answers with JSON on stdout — the same way the build engine
//! delegates compilation and typesetting to external tools.
//!
//! The driver is idempotent: an existing task is updated in place, a
//! missing one is created, and re-running after a network failure performs
//! no rebuilds because the result directory and cache are untouched.

use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::TaskConfig;
use crate::error::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTaskId(pub i64);

pub trait ContestService {
    /// Look up a task by name; `None` if the service doesn't know it yet.
    fn find_task(&mut self, name: &str) -> Result<Option<RemoteTaskId>, UploadError>;

    /// Create the task from the result directory.
    fn create_task(&mut self, name: &str, result_dir: &Utf8Path)
    -> Result<RemoteTaskId, UploadError>;

    /// Update an existing task in place from the result directory.
    fn update_task(
        &mut self,
        id: RemoteTaskId,
        name: &str,
        result_dir: &Utf8Path,
    ) -> Result<(), UploadError>;

    /// Submit a solution source against the task and return the score the
    /// service observed for it.
    fn submit_test(&mut self, id: RemoteTaskId, source: &Utf8Path) -> Result<f64, UploadError>;
}

#[derive(Debug)]
pub struct SubmissionOutcome {
    pub source: Utf8PathBuf,
    pub expected: f64,
    pub observed: f64,
}

impl SubmissionOutcome {
    pub fn passed(&self) -> bool {
        (self.observed - self.expected).abs() < 1e-4
    }
}

#[derive(Debug)]
pub struct UploadReport {
    pub task: RemoteTaskId,
    /// Whether the task was created (as opposed to updated in place).
    pub created: bool,
    pub submissions: Vec<SubmissionOutcome>,
}

impl UploadReport {
    pub fn all_passed(&self) -> bool {
        self.submissions.iter().all(SubmissionOutcome::passed)
    }
}

/// Create or update the task on the service, then verify the declared test
/// submissions against their expected scores.
pub fn upload(
    config: &TaskConfig,
    root: &Utf8Path,
    result_dir: &Utf8Path,
    service: &mut dyn ContestService,
    run_tests: bool,
) -> Result<UploadReport, UploadError> {
    let (task, created) = match service.find_task(&config.name)? {
        Some(id) => {
            tracing::info!("updating existing task {} (id {})", config.name, id.0);
            service.update_task(id, &config.name, result_dir)?;
            (id, false)
        }
        None => {
            tracing::info!("creating task {}", config.name);
            let id = service.create_task(&config.name, result_dir)?;
            (id, true)
        }
    };

    let mut submissions = Vec::new();
    if run_tests {
        for (source, &expected) in &config.test_submissions {
            let path = root.join(source);
            let observed = service.submit_test(task, &path)?;
            let outcome = SubmissionOutcome {
                source: path,
                expected,
                observed,
            };
            if outcome.passed() {
                tracing::info!("{source}: scored {observed}");
            } else {
                tracing::warn!("{source}: expected {expected}, scored {observed}");
            }
            submissions.push(outcome);
        }
    }

    Ok(UploadReport {
        task,
        created,
        submissions,
    })
}

// ******************************
// *       CommandService       *
// ******************************

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServiceRequest<'a> {
    FindTask {
        name: &'a str,
    },
    CreateTask {
        name: &'a str,
        result_dir: &'a str,
    },
    UpdateTask {
        id: i64,
        name: &'a str,
        result_dir: &'a str,
    },
    SubmitTest {
        id: i64,
        source: &'a str,
    },
}

#[derive(Debug, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// A [`ContestService`] that forwards every operation to an external
/// command, passing the request as JSON on stdin and reading a JSON reply
/// from stdout.
pub struct CommandService {
    argv: Vec<String>,
}

impl CommandService {
    /// Build from a shell-style command line, e.g. `"cms-bridge --contest 7"`.
    pub fn from_command_line(command: &str) -> Result<Self, UploadError> {
        let argv = shlex::split(command).filter(|argv| !argv.is_empty());
        match argv {
            Some(argv) => Ok(CommandService { argv }),
            None => Err(UploadError::NotConfigured),
        }
    }

    fn call(&mut self, op: &'static str, request: &ServiceRequest) -> Result<ServiceReply, UploadError> {
        let payload = serde_json::to_vec(request)?;

        let mut child = std::process::Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| UploadError::Spawn {
                program: self.argv[0].clone(),
                source,
            })?;

        {
            use std::io::Write;
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin.write_all(&payload)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(UploadError::ServiceExit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let reply: ServiceReply = serde_json::from_slice(&output.stdout)?;
        if let Some(message) = reply.error {
            return Err(UploadError::Rejected { op, message });
        }
        Ok(reply)
    }
}

impl ContestService for CommandService {
    fn find_task(&mut self, name: &str) -> Result<Option<RemoteTaskId>, UploadError> {
        let reply = self.call("find_task", &ServiceRequest::FindTask { name })?;
        Ok(reply.id.map(RemoteTaskId))
    }

    fn create_task(
        &mut self,
        name: &str,
        result_dir: &Utf8Path,
    ) -> Result<RemoteTaskId, UploadError> {
        let reply = self.call(
            "create_task",
            &ServiceRequest::CreateTask {
                name,
                result_dir: result_dir.as_str(),
            },
        )?;
        reply
            .id
            .map(RemoteTaskId)
            .ok_or_else(|| UploadError::Rejected {
                op: "create_task",
                message: "reply carried no task id".to_string(),
            })
    }

    fn update_task(
        &mut self,
        id: RemoteTaskId,
        name: &str,
        result_dir: &Utf8Path,
    ) -> Result<(), UploadError> {
        self.call(
            "update_task",
            &ServiceRequest::UpdateTask {
                id: id.0,
                name,
                result_dir: result_dir.as_str(),
            },
        )?;
        Ok(())
    }

    fn submit_test(&mut self, id: RemoteTaskId, source: &Utf8Path) -> Result<f64, UploadError> {
        let reply = self.call(
            "submit_test",
            &ServiceRequest::SubmitTest {
                id: id.0,
                source: source.as_str(),
            },
        )?;
        reply.score.ok_or_else(|| UploadError::Rejected {
            op: "submit_test",
            message: "reply carried no score".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use std::fs;

    /// In-memory service that records operations and plays back scores.
    #[derive(Default)]
    struct MockService {
        tasks: Vec<String>,
        ops: Vec<String>,
        score: f64,
    }

    impl ContestService for MockService {
        fn find_task(&mut self, name: &str) -> Result<Option<RemoteTaskId>, UploadError> {
            self.ops.push(format!("find {name}"));
            Ok(self
                .tasks
                .iter()
                .position(|t| t == name)
                .map(|i| RemoteTaskId(i as i64)))
        }

        fn create_task(
            &mut self,
            name: &str,
            _result_dir: &Utf8Path,
        ) -> Result<RemoteTaskId, UploadError> {
            self.ops.push(format!("create {name}"));
            self.tasks.push(name.to_string());
            Ok(RemoteTaskId(self.tasks.len() as i64 - 1))
        }

        fn update_task(
            &mut self,
            id: RemoteTaskId,
            name: &str,
            _result_dir: &Utf8Path,
        ) -> Result<(), UploadError> {
            self.ops.push(format!("update {name} ({})", id.0));
            Ok(())
        }

        fn submit_test(
            &mut self,
            _id: RemoteTaskId,
            source: &Utf8Path,
        ) -> Result<f64, UploadError> {
            self.ops
                .push(format!("submit {}", source.file_name().unwrap()));
            Ok(self.score)
        }
    }

    fn test_config(root: &Utf8Path) -> TaskConfig {
        fs::write(root.join("full.cpp"), "int main() {}").unwrap();
        fs::write(
            root.join(config::TASK_FILE),
            "\
name: sum
long_name: Addition
statements:
  en: !raw statement
score_options: {}
time_limit: 1.0s
memory_limit: 256MiB
task_type: BATCH
test_submissions:
  full.cpp: 100
subtasks:
  - points: 100
    testcases:
      - input: !raw '1'
        output: !raw '2'
",
        )
        .unwrap();
        config::load(root).unwrap()
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn upload_creates_then_updates() {
        let (_guard, root) = scratch();
        let config = test_config(&root);
        let result_dir = root.join("result");
        let mut service = MockService {
            score: 100.0,
            ..MockService::default()
        };

        let first = upload(&config, &root, &result_dir, &mut service, true).unwrap();
        assert!(first.created);
        assert!(first.all_passed());
        assert_eq!(first.submissions.len(), 1);

        let second = upload(&config, &root, &result_dir, &mut service, true).unwrap();
        assert!(!second.created);
        assert_eq!(second.task, first.task);

        assert_eq!(
            service.ops,
            vec![
                "find sum",
                "create sum",
                "submit full.cpp",
                "find sum",
                "update sum (0)",
                "submit full.cpp",
            ]
        );
    }

    #[test]
    fn score_mismatches_are_reported_not_fatal() {
        let (_guard, root) = scratch();
        let config = test_config(&root);
        let result_dir = root.join("result");
        let mut service = MockService {
            score: 40.0,
            ..MockService::default()
        };

        let report = upload(&config, &root, &result_dir, &mut service, true).unwrap();
        assert!(!report.all_passed());
        assert_eq!(report.submissions[0].expected, 100.0);
        assert_eq!(report.submissions[0].observed, 40.0);
    }

    #[test]
    fn tests_can_be_skipped() {
        let (_guard, root) = scratch();
        let config = test_config(&root);
        let mut service = MockService::default();

        let report = upload(&config, &root, &root.join("result"), &mut service, false).unwrap();
        assert!(report.submissions.is_empty());
    }

    #[test]
    fn empty_service_command_is_rejected() {
        assert!(matches!(
            CommandService::from_command_line("  "),
            Err(UploadError::NotConfigured)
        ));
    }
}
