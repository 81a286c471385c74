use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use taskmill::{BuildOptions, CommandService, TaskmillError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmill", version, about = "Contest task build and upload tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Worker pool size (defaults to available parallelism).
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Build testcases, statements and other artifacts.
    Build {
        #[arg(required = true)]
        task_dirs: Vec<Utf8PathBuf>,
    },
    /// Build, then create or update the task on the contest service.
    Upload {
        #[arg(required = true)]
        task_dirs: Vec<Utf8PathBuf>,

        /// Contest service command (JSON on stdio); defaults to
        /// $TASKMILL_SERVICE.
        #[arg(long)]
        service: Option<String>,

        /// Skip test-submission verification.
        #[arg(long)]
        no_tests: bool,
    },
    /// Delete the cache and result tree.
    Clean {
        #[arg(required = true)]
        task_dirs: Vec<Utf8PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), TaskmillError> {
    let options = BuildOptions {
        workers: cli.jobs.unwrap_or(0),
    };

    match cli.command {
        Command::Build { task_dirs } => {
            for dir in &task_dirs {
                taskmill::build_task(dir, &options)?;
            }
            Ok(())
        }

        Command::Upload {
            task_dirs,
            service,
            no_tests,
        } => {
            let command = service
                .or_else(|| std::env::var("TASKMILL_SERVICE").ok())
                .ok_or_else(|| TaskmillError::Upload {
                    task: task_dirs[0].to_string(),
                    source: taskmill::UploadError::NotConfigured,
                })?;

            for dir in &task_dirs {
                let mut service = CommandService::from_command_line(&command).map_err(
                    |source| TaskmillError::Upload {
                        task: dir.to_string(),
                        source,
                    },
                )?;
                let (outcome, report) =
                    taskmill::upload_task(dir, &options, &mut service, !no_tests)?;

                let verb = if report.created { "created" } else { "updated" };
                eprintln!(
                    "{} task {} (id {})",
                    verb,
                    style(&outcome.task).red(),
                    report.task.0
                );
                for submission in &report.submissions {
                    let mark = if submission.passed() {
                        style("ok").green()
                    } else {
                        style("MISMATCH").red().bold()
                    };
                    eprintln!(
                        "  {}: expected {}, scored {} [{mark}]",
                        submission.source,
                        submission.expected,
                        submission.observed
                    );
                }
                if !report.all_passed() {
                    return Err(TaskmillError::Upload {
                        task: outcome.task,
                        source: taskmill::UploadError::Rejected {
                            op: "submit_test",
                            message: "test submissions scored differently than expected"
                                .to_string(),
                        },
                    });
                }
            }
            Ok(())
        }

        Command::Clean { task_dirs } => {
            for dir in &task_dirs {
                taskmill::clean_task(dir)?;
            }
            Ok(())
        }
    }
}
