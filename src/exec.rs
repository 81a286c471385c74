//! The executor: drains the compiled graph on a bounded worker pool.
//!
//! A single scheduler loop owns all node state. Workers receive fully
//! resolved work, run it, and report back over a channel; the scheduler is
//! therefore the only place a node can move from `Pending` to `Building`,
//! which guarantees at-most-one execution per node id no matter how many
//! dependents become ready concurrently.
//!
//! A node whose recomputed fingerprint matches the cache transitions
//! straight to done without being dispatched. On the first failure the
//! scheduler stops issuing new work, lets in-flight actions finish (their
//! artifacts stay cached), marks every transitive dependent of the failed
//! node as failed, and reports the aggregated failure set.

use std::fs;
use std::io::Read;
use std::time::Duration;

use camino::Utf8Path;
use crossbeam_channel::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::cache::CacheStore;
use crate::core::{Blake3Hasher, Hash32};
use crate::error::{ActionError, NodeFailure};
use crate::graph::{Artifact, BuildNode, BuildPlan, Work};
use crate::io::{link_or_copy, write_atomic};

#[derive(Debug, Default)]
pub(crate) struct RunReport {
    pub total: usize,
    /// Nodes whose action actually ran.
    pub executed: usize,
    /// Nodes satisfied from the cache without running anything.
    pub cached: usize,
    /// Nodes never dispatched because of an earlier failure.
    pub skipped: usize,
    pub failures: Vec<NodeFailure>,
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Pending,
    Building,
    Done { fingerprint: Hash32 },
    Failed,
}

pub(crate) fn execute(
    plan: &BuildPlan,
    cache: &mut CacheStore,
    workers: usize,
) -> std::io::Result<RunReport> {
    fs::create_dir_all(crate::build_dir(&plan.root))?;

    // The graph is acyclic by construction (a node only references already
    // compiled dependencies); this is a structural sanity check.
    toposort(&plan.graph, None).expect("task graph must be acyclic");

    let total = plan.graph.node_count();
    let mut report = RunReport {
        total,
        ..RunReport::default()
    };
    if total == 0 {
        return Ok(report);
    }

    let workers = if workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        workers
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(std::io::Error::other)?;

    // Dependency bookkeeping, edges run dependency -> dependent.
    let mut dependents: Vec<Vec<NodeIndex>> = vec![Vec::new(); total];
    for edge in plan.graph.raw_edges() {
        dependents[edge.source().index()].push(edge.target());
    }
    let mut deps_left: Vec<usize> = plan
        .graph
        .node_indices()
        .map(|ix| plan.graph.neighbors_directed(ix, Direction::Incoming).count())
        .collect();

    let mut states = vec![State::Pending; total];
    let mut fingerprints: Vec<Option<Hash32>> = vec![None; total];
    let mut failed_any = false;
    let mut propagated = 0usize;

    let mp = MultiProgress::new();
    let main_pb = mp.add(ProgressBar::new(total as u64));
    main_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("invalid progress bar template")
            .progress_chars("#>-"),
    );
    main_pb.set_message("Building task...");
    let spinner_style = ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("invalid progress bar template");

    let (sender, receiver) = unbounded::<(NodeIndex, Result<(), ActionError>)>();

    pool.scope(|s| {
        let mut ready: Vec<NodeIndex> = plan
            .graph
            .node_indices()
            .filter(|ix| deps_left[ix.index()] == 0)
            .collect();
        let mut outstanding = 0usize;

        loop {
            // Drain everything that is ready right now. Nodes that were
            // ready before a failure was observed still run; after the
            // first failure nothing new is allowed to become ready.
            while let Some(ix) = ready.pop() {
                if states[ix.index()] != State::Pending {
                    continue;
                }
                let node = &plan.graph[ix];

                let fingerprint = match node_fingerprint(&plan.graph, &states, ix) {
                    Ok(fingerprint) => fingerprint,
                    Err(error) => {
                        fail(
                            ix,
                            error,
                            &plan.graph,
                            &mut states,
                            &mut report.failures,
                            &mut propagated,
                        );
                        failed_any = true;
                        main_pb.inc(1);
                        continue;
                    }
                };
                fingerprints[ix.index()] = Some(fingerprint);

                if let Some(artifact) = cache.lookup(node.id, fingerprint) {
                    match link_or_copy(&artifact, &node.out) {
                        Ok(()) => {
                            tracing::debug!("cache hit for {}", node.label);
                            states[ix.index()] = State::Done { fingerprint };
                            report.cached += 1;
                            main_pb.inc(1);
                            for &dependent in &dependents[ix.index()] {
                                deps_left[dependent.index()] -= 1;
                                if deps_left[dependent.index()] == 0 && !failed_any {
                                    ready.push(dependent);
                                }
                            }
                            continue;
                        }
                        Err(error) => {
                            fail(
                                ix,
                                ActionError::Io(error),
                                &plan.graph,
                                &mut states,
                                &mut report.failures,
                                &mut propagated,
                            );
                            failed_any = true;
                            main_pb.inc(1);
                            continue;
                        }
                    }
                }

                // Claim: the only Pending -> Building transition in the
                // program, performed by this single scheduler loop.
                states[ix.index()] = State::Building;
                outstanding += 1;

                let sender = sender.clone();
                let mp = mp.clone();
                let style = spinner_style.clone();
                s.spawn(move |_| {
                    let pb = mp.add(ProgressBar::new_spinner());
                    pb.set_style(style);
                    pb.set_message(node.label.clone());
                    pb.enable_steady_tick(Duration::from_millis(100));

                    let result = run_node(node);

                    pb.finish_and_clear();
                    let _ = sender.send((ix, result));
                });
            }

            if outstanding == 0 {
                break;
            }

            let (ix, result) = receiver.recv().expect("worker channel closed early");
            outstanding -= 1;
            main_pb.inc(1);

            match result {
                Ok(()) => {
                    let node = &plan.graph[ix];
                    let fingerprint =
                        fingerprints[ix.index()].expect("dispatched nodes are fingerprinted");
                    if let Err(error) = cache.store(node.id, fingerprint, &node.out) {
                        fail(
                            ix,
                            ActionError::Io(error),
                            &plan.graph,
                            &mut states,
                            &mut report.failures,
                            &mut propagated,
                        );
                        failed_any = true;
                        continue;
                    }
                    states[ix.index()] = State::Done { fingerprint };
                    report.executed += 1;
                    for &dependent in &dependents[ix.index()] {
                        deps_left[dependent.index()] -= 1;
                        if deps_left[dependent.index()] == 0 && !failed_any {
                            ready.push(dependent);
                        }
                    }
                }
                Err(error) => {
                    fail(
                        ix,
                        error,
                        &plan.graph,
                        &mut states,
                        &mut report.failures,
                        &mut propagated,
                    );
                    failed_any = true;
                }
            }
        }
    });

    report.skipped = propagated
        + states
            .iter()
            .filter(|&&state| state == State::Pending)
            .count();

    if report.failures.is_empty() {
        main_pb.finish_with_message("Build complete");
    } else {
        main_pb.finish_with_message(format!("Build failed ({} nodes)", report.failures.len()));
    }

    Ok(report)
}

/// Mark `ix` failed and propagate to every transitive dependent; none of
/// them will ever be dispatched.
fn fail(
    ix: NodeIndex,
    error: ActionError,
    graph: &DiGraph<BuildNode, ()>,
    states: &mut [State],
    failures: &mut Vec<NodeFailure>,
    propagated: &mut usize,
) {
    tracing::error!("{} failed: {error}", graph[ix].label);
    failures.push(NodeFailure {
        node: graph[ix].label.clone(),
        error,
    });
    states[ix.index()] = State::Failed;

    let mut dfs = Dfs::new(graph, ix);
    while let Some(nx) = dfs.next(graph) {
        if nx != ix && states[nx.index()] == State::Pending {
            states[nx.index()] = State::Failed;
            *propagated += 1;
        }
    }
}

/// Everything that can affect a node's output: rule kind, canonical
/// arguments, dependency fingerprints in order, and the content hash of
/// every leaf input file.
fn node_fingerprint(
    graph: &DiGraph<BuildNode, ()>,
    states: &[State],
    ix: NodeIndex,
) -> Result<Hash32, ActionError> {
    let node = &graph[ix];
    let mut hasher = Blake3Hasher::default();
    hasher.push(node.kind);
    for arg in &node.canon {
        hasher.push(arg);
    }
    for &dep in &node.deps {
        match states[dep.index()] {
            State::Done { fingerprint } => {
                hasher.push(fingerprint.as_bytes());
            }
            _ => unreachable!("dependencies complete before a node becomes ready"),
        }
    }
    for input in &node.inputs {
        let hash = Hash32::hash_file(input).map_err(|err| missing_or(err, input))?;
        hasher.push(hash.as_bytes());
    }
    Ok(hasher.finish())
}

fn missing_or(err: std::io::Error, path: &Utf8Path) -> ActionError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ActionError::MissingInput {
            path: path.to_owned(),
        }
    } else {
        ActionError::Io(err)
    }
}

fn run_node(node: &BuildNode) -> Result<(), ActionError> {
    match &node.work {
        Work::WriteText { text } => {
            write_atomic(&node.out, text.as_bytes())?;
            Ok(())
        }

        Work::Gunzip { src } => {
            let compressed = fs::read(src).map_err(|err| missing_or(err, src))?;
            let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
            let mut plain = Vec::new();
            decoder.read_to_end(&mut plain)?;
            write_atomic(&node.out, &plain)?;
            Ok(())
        }

        Work::Zip { members } => {
            let mut buffer = std::io::Cursor::new(Vec::new());
            let mut writer = zip::ZipWriter::new(&mut buffer);
            // Fixed timestamps keep archives byte-stable across runs.
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .last_modified_time(zip::DateTime::default());
            for (name, path) in members {
                let bytes = fs::read(path).map_err(|err| missing_or(err, path))?;
                writer.start_file(name.as_str(), options.clone())?;
                std::io::Write::write_all(&mut writer, &bytes)?;
            }
            writer.finish()?;
            write_atomic(&node.out, buffer.get_ref())?;
            Ok(())
        }

        Work::Command {
            argv,
            cwd,
            stdin,
            env,
            artifact,
        } => {
            // Scratch directory for actions without a pinned working dir;
            // whatever the tool drops there is discarded with it.
            let scratch = tempfile::tempdir()?;
            let program = &argv[0];

            let mut cmd = std::process::Command::new(program);
            cmd.args(&argv[1..]);
            match cwd {
                Some(dir) => cmd.current_dir(dir),
                None => cmd.current_dir(scratch.path()),
            };
            for (key, value) in env {
                cmd.env(key, value);
            }
            match stdin {
                Some(path) => {
                    let file = fs::File::open(path).map_err(|err| missing_or(err, path))?;
                    cmd.stdin(file);
                }
                None => {
                    cmd.stdin(std::process::Stdio::null());
                }
            }

            let output = cmd.output().map_err(|source| ActionError::Spawn {
                program: program.clone(),
                source,
            })?;
            if !output.status.success() {
                return Err(ActionError::ExitStatus {
                    program: program.clone(),
                    status: output.status,
                    stderr: excerpt(&output.stderr),
                });
            }

            match artifact {
                Artifact::Stdout => write_atomic(&node.out, &output.stdout)?,
                Artifact::File(path) => {
                    if !path.is_file() {
                        return Err(ActionError::NoArtifact {
                            program: program.clone(),
                            path: path.clone(),
                        });
                    }
                    if path != &node.out {
                        link_or_copy(path, &node.out)?;
                    }
                }
            }
            Ok(())
        }
    }
}

fn excerpt(bytes: &[u8]) -> String {
    const LIMIT: usize = 2000;
    let text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() <= LIMIT {
        return text;
    }
    let start = text.len() - LIMIT;
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(start);
    format!("…{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::CacheStore, config, graph};
    use camino::Utf8PathBuf;
    use std::io::Write as _;

    const BASE: &str = "\
name: sum
long_name: Addition
statements:
  en: !raw statement
score_options: {}
time_limit: 1.0s
memory_limit: 256MiB
task_type: BATCH
";

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        (dir, path)
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn plan_for(root: &Utf8Path, yaml: &str) -> graph::BuildPlan {
        fs::write(root.join(config::TASK_FILE), yaml).unwrap();
        let cfg = config::load(root).unwrap();
        graph::compile(&cfg, root).unwrap()
    }

    fn run(root: &Utf8Path, plan: &graph::BuildPlan, workers: usize) -> RunReport {
        let mut cache = CacheStore::open(&crate::cache_dir(root)).unwrap();
        let report = execute(plan, &mut cache, workers).unwrap();
        cache.flush().unwrap();
        report
    }

    #[test]
    fn second_build_is_fully_cached() {
        let (_guard, root) = scratch();
        fs::write(root.join("data.in.gz"), gzip(b"payload")).unwrap();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: data.in.gz
        output: !raw 'expected'
"
        );

        let plan = plan_for(&root, &yaml);
        let first = run(&root, &plan, 2);
        assert!(first.failures.is_empty(), "{:?}", first.failures);
        assert_eq!(first.executed, first.total);
        assert_eq!(first.cached, 0);

        // No change to inputs or configuration: zero actions run.
        let plan = plan_for(&root, &yaml);
        let second = run(&root, &plan, 2);
        assert!(second.failures.is_empty());
        assert_eq!(second.executed, 0);
        assert_eq!(second.cached, second.total);
    }

    #[test]
    fn mutating_one_input_rebuilds_only_its_subgraph() {
        let (_guard, root) = scratch();
        fs::write(root.join("a.in.gz"), gzip(b"aaa")).unwrap();
        fs::write(root.join("b.in.gz"), gzip(b"bbb")).unwrap();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: a.in.gz
        output: !raw 'a out'
      - input: b.in.gz
        output: !raw 'b out'
"
        );

        let plan = plan_for(&root, &yaml);
        let first = run(&root, &plan, 2);
        assert!(first.failures.is_empty());

        fs::write(root.join("a.in.gz"), gzip(b"changed")).unwrap();
        let plan = plan_for(&root, &yaml);
        let second = run(&root, &plan, 2);
        assert!(second.failures.is_empty());
        assert_eq!(second.executed, 1, "only the touched gunzip node reruns");
        assert_eq!(second.cached, second.total - 1);
    }

    #[cfg(unix)]
    #[test]
    fn failure_skips_dependents_and_keeps_independent_artifacts() {
        use std::os::unix::fs::PermissionsExt;

        let (_guard, root) = scratch();
        fs::write(root.join("case.in.gz"), gzip(b"1 2\n")).unwrap();
        let sol = root.join("sol.sh");
        fs::write(&sol, "#!/bin/sh\ncat\n").unwrap();
        fs::set_permissions(&sol, fs::Permissions::from_mode(0o755)).unwrap();
        let yaml = format!(
            "{BASE}\
sample_solution: sol.sh
subtasks:
  - points: 100
    testcases:
      - input: case.in.gz
"
        );

        // Compile while the input exists, then break it: the gunzip node
        // fails at execution time, its dependent samplesol run is skipped,
        // and the independent statement node still succeeds and is cached.
        let plan = plan_for(&root, &yaml);
        fs::remove_file(root.join("case.in.gz")).unwrap();
        let broken = run(&root, &plan, 2);
        assert_eq!(broken.failures.len(), 1);
        assert!(matches!(
            broken.failures[0].error,
            ActionError::MissingInput { .. }
        ));
        assert_eq!(broken.skipped, 1);
        assert_eq!(broken.executed, 1);

        // Fix the input and rerun: the statement node is not rebuilt, only
        // the previously failed chain runs.
        fs::write(root.join("case.in.gz"), gzip(b"1 2\n")).unwrap();
        let plan = plan_for(&root, &yaml);
        let fixed = run(&root, &plan, 2);
        assert!(fixed.failures.is_empty(), "{:?}", fixed.failures);
        assert_eq!(fixed.cached, 1);
        assert_eq!(fixed.executed, 2);

        // The generated expected output is the solution's stdout.
        let output = plan.path_of(plan.subtasks[0].testcases[0].output);
        assert_eq!(fs::read(output).unwrap(), b"1 2\n");
    }

    #[cfg(unix)]
    #[test]
    fn shell_stdout_is_the_artifact() {
        let (_guard, root) = scratch();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: !shell \"sh -c 'printf 1:2'\"
        output: !raw '3'
"
        );

        let plan = plan_for(&root, &yaml);
        let report = run(&root, &plan, 2);
        assert!(report.failures.is_empty(), "{:?}", report.failures);

        let input = plan.path_of(plan.subtasks[0].testcases[0].input);
        assert_eq!(fs::read(input).unwrap(), b"1:2");
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_fails_even_with_output() {
        let (_guard, root) = scratch();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: !shell \"sh -c 'echo partial; exit 3'\"
        output: !raw 'x'
"
        );

        let plan = plan_for(&root, &yaml);
        let report = run(&root, &plan, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].error,
            ActionError::ExitStatus { .. }
        ));
    }

    #[test]
    fn worker_count_does_not_change_artifacts() {
        let yaml = format!(
            "{BASE}\
attachments:
  bundle.zip: !zip 'a.txt b.txt'
subtasks:
  - points: 100
    testcases:
      - input: !raw 'in'
        output: !raw 'out'
"
        );

        let mut artifacts = Vec::new();
        for workers in [1, 4] {
            let (_guard, root) = scratch();
            fs::write(root.join("a.txt"), b"alpha").unwrap();
            fs::write(root.join("b.txt"), b"beta").unwrap();

            let plan = plan_for(&root, &yaml);
            let report = run(&root, &plan, workers);
            assert!(report.failures.is_empty());

            let mut ids: Vec<_> = plan
                .graph
                .node_indices()
                .map(|ix| plan.graph[ix].id.to_hex())
                .collect();
            ids.sort();

            let zip_node = plan
                .graph
                .node_indices()
                .find(|&ix| plan.graph[ix].kind == "zip")
                .unwrap();
            let bytes = fs::read(&plan.graph[zip_node].out).unwrap();
            artifacts.push((ids, bytes));
        }

        assert_eq!(artifacts[0], artifacts[1]);
    }
}
