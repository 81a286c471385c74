//! The graph compiler: a recursive, post-order walk of the configuration
//! tree that turns every tag expression into a deduplicated build node.
//!
//! Nodes live in an arena (a `petgraph` graph) and reference each other by
//! index, so cycle-freedom is structural: a node can only depend on nodes
//! that already exist. The id of a node is a hash over its rule kind, its
//! canonical arguments and the ids of its dependencies; a memoization table
//! keyed by this id makes two identical tag occurrences compile to a single
//! node, however many configuration fields reference them.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::config::{FileRef, FileSpec, TaskConfig, TaskType};
use crate::core::{Blake3Hasher, NodeId};
use crate::error::GraphError;
use crate::tag::{Tag, TagArg, TagKind};

/// Where a command's artifact comes from once the process has exited.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Artifact {
    /// The captured standard output is the artifact, byte for byte.
    Stdout,
    /// The tool wrote the artifact to this path.
    File(Utf8PathBuf),
}

/// The concrete work a node performs when dispatched.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Work {
    Command {
        argv: Vec<String>,
        /// Working directory; `None` means a per-dispatch scratch directory.
        cwd: Option<Utf8PathBuf>,
        stdin: Option<Utf8PathBuf>,
        env: Vec<(String, String)>,
        artifact: Artifact,
    },
    WriteText {
        text: String,
    },
    Gunzip {
        src: Utf8PathBuf,
    },
    Zip {
        members: Vec<(String, Utf8PathBuf)>,
    },
}

/// A compiled, deduplicated unit of work.
#[derive(Debug)]
pub(crate) struct BuildNode {
    pub id: NodeId,
    /// Rule discriminator, part of the id and the fingerprint.
    pub kind: &'static str,
    /// Human-readable label for progress display and error reports.
    pub label: String,
    /// Canonical arguments, hashed into the id and the fingerprint.
    pub canon: Vec<String>,
    /// Dependencies in argument order; fingerprints are folded in this order.
    pub deps: Vec<NodeIndex>,
    /// Leaf input files whose content feeds the fingerprint.
    pub inputs: Vec<Utf8PathBuf>,
    /// Where the finished artifact is placed, under the build directory.
    pub out: Utf8PathBuf,
    pub work: Work,
}

/// A file the plan refers to: either a plain source file or the output of a
/// build node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Source {
    File(NodeIndex),
    Plain(usize),
}

// `Source` must be cheap to copy and cannot borrow the compiler, so plain
// files are interned into `BuildPlan::files` and referenced by index.

/// Logical role of a deliverable in the result tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Role {
    Statement(String),
    StatementHtml,
    DefaultInput,
    Attachment(String),
    Grader(String),
    Checker,
    Manager,
    SampleSolution,
    EditorTemplate(String),
    TestGrader(String),
    TestSubmission(String),
}

#[derive(Debug)]
pub(crate) struct Deliverable {
    pub role: Role,
    pub source: Source,
}

#[derive(Debug)]
pub(crate) struct PlannedTestcase {
    pub codename: String,
    pub public: bool,
    pub input: Source,
    pub output: Source,
}

#[derive(Debug)]
pub(crate) struct PlannedSubtask {
    pub points: f64,
    pub public: bool,
    pub testcases: Vec<PlannedTestcase>,
}

/// The executable DAG plus everything the materializer needs afterwards.
#[derive(Debug)]
pub(crate) struct BuildPlan {
    pub root: Utf8PathBuf,
    pub graph: DiGraph<BuildNode, ()>,
    pub files: Vec<Utf8PathBuf>,
    pub subtasks: Vec<PlannedSubtask>,
    pub deliverables: Vec<Deliverable>,
}

impl BuildPlan {
    /// Absolute path of whatever a `Source` stands for.
    pub(crate) fn path_of(&self, source: Source) -> &Utf8Path {
        match source {
            Source::File(ix) => &self.graph[ix].out,
            Source::Plain(i) => &self.files[i],
        }
    }
}

pub(crate) fn compile(config: &TaskConfig, root: &Utf8Path) -> Result<BuildPlan, GraphError> {
    Compiler::new(config, root)?.run()
}

struct Compiler<'a> {
    config: &'a TaskConfig,
    root: &'a Utf8Path,
    build_dir: Utf8PathBuf,
    graph: DiGraph<BuildNode, ()>,
    memo: HashMap<NodeId, NodeIndex>,
    files: Vec<Utf8PathBuf>,
    gcc_argv: Vec<String>,
    latexmk_argv: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn new(config: &'a TaskConfig, root: &'a Utf8Path) -> Result<Self, GraphError> {
        let gcc_argv = split_args(&config.cpp.gcc_args, "cpp_config.gcc_args")?;
        let latexmk_argv = split_args(&config.latex.latexmk_args, "latex_config.latexmk_args")?;

        Ok(Compiler {
            config,
            root,
            build_dir: crate::build_dir(root),
            graph: DiGraph::new(),
            memo: HashMap::new(),
            files: Vec::new(),
            gcc_argv,
            latexmk_argv,
        })
    }

    fn run(mut self) -> Result<BuildPlan, GraphError> {
        let config = self.config;
        let mut deliverables = Vec::new();

        for (lang, statement) in &config.statements {
            let source = self.resolve_ref(statement, &format!("statements.{lang}"))?;
            deliverables.push(Deliverable {
                role: Role::Statement(lang.clone()),
                source,
            });
        }
        if let Some(html) = &config.statement_html {
            let source = self.resolve_ref(html, "statement_html")?;
            deliverables.push(Deliverable {
                role: Role::StatementHtml,
                source,
            });
        }
        if let Some(input) = &config.default_input {
            let source = self.resolve_ref(input, "default_input")?;
            deliverables.push(Deliverable {
                role: Role::DefaultInput,
                source,
            });
        }
        for (name, attachment) in &config.attachments {
            let source = self.resolve_ref(attachment, &format!("attachments.{name}"))?;
            deliverables.push(Deliverable {
                role: Role::Attachment(name.clone()),
                source,
            });
        }
        for (i, grader) in config.grader.iter().enumerate() {
            let source = self.resolve_ref(grader, &format!("grader[{i}]"))?;
            deliverables.push(Deliverable {
                role: Role::Grader(self.source_name(source)),
                source,
            });
        }
        if let Some(checker) = &config.checker {
            let source = self.resolve_ref(checker, "checker")?;
            deliverables.push(Deliverable {
                role: Role::Checker,
                source,
            });
        }
        if let TaskType::Communication { manager, .. } = &config.task_type {
            let source = self.resolve_ref(manager, "task_type.manager")?;
            deliverables.push(Deliverable {
                role: Role::Manager,
                source,
            });
        }
        for (i, template) in config.editor_templates.iter().enumerate() {
            let source = self.resolve_ref(template, &format!("editor_templates[{i}]"))?;
            deliverables.push(Deliverable {
                role: Role::EditorTemplate(self.source_name(source)),
                source,
            });
        }
        for (i, grader) in config.test_grader.iter().enumerate() {
            let source = self.resolve_ref(grader, &format!("test_grader[{i}]"))?;
            deliverables.push(Deliverable {
                role: Role::TestGrader(self.source_name(source)),
                source,
            });
        }
        for path in config.test_submissions.keys() {
            let field = format!("test_submissions.{path}");
            let abs = self.resolve_path(path, &field)?;
            let source = self.plain(abs);
            deliverables.push(Deliverable {
                role: Role::TestSubmission(self.source_name(source)),
                source,
            });
        }

        let sample_solution = match &config.sample_solution {
            Some(sol) => {
                let source = self.resolve_ref(sol, "sample_solution")?;
                deliverables.push(Deliverable {
                    role: Role::SampleSolution,
                    source,
                });
                Some(source)
            }
            None => None,
        };
        let testcase_checker = match &config.testcase_checker {
            Some(checker) => Some(self.resolve_ref(checker, "testcase_checker")?),
            None => None,
        };

        let subtasks = self.assemble_testcases(sample_solution, testcase_checker)?;

        Ok(BuildPlan {
            root: self.root.to_owned(),
            graph: self.graph,
            files: self.files,
            subtasks,
            deliverables,
        })
    }

    // ******************************
    // *     Testcase assembly      *
    // ******************************

    fn assemble_testcases(
        &mut self,
        sample_solution: Option<Source>,
        testcase_checker: Option<Source>,
    ) -> Result<Vec<PlannedSubtask>, GraphError> {
        let config = self.config;
        let mut subtasks = Vec::with_capacity(config.subtasks.len());

        for (si, subtask) in config.subtasks.iter().enumerate() {
            let st = si + 1;
            let mut seq = 0usize;
            let mut testcases = Vec::new();

            for (tj, tc) in subtask.testcases.iter().enumerate() {
                let field = format!("subtasks[{si}].testcases[{tj}]");

                // Expand wildcards into concrete (input, output) pairs,
                // positionally matched over the sorted match lists.
                let pairs: Vec<(String, Option<String>)> = match &tc.input {
                    FileSpec::Glob(pattern) => {
                        let inputs = self.expand_glob(pattern, &format!("{field}.input"))?;
                        let outputs = match &tc.output {
                            None => None,
                            Some(FileSpec::Glob(pattern)) => {
                                Some(self.expand_glob(pattern, &format!("{field}.output"))?)
                            }
                            Some(_) => {
                                return Err(GraphError::Invalid {
                                    field: format!("{field}.output"),
                                    reason: "output must be a wildcard when input is one"
                                        .to_string(),
                                });
                            }
                        };
                        if let Some(outputs) = &outputs
                            && outputs.len() != inputs.len()
                        {
                            return Err(GraphError::GlobMismatch {
                                field,
                                inputs: inputs.len(),
                                outputs: outputs.len(),
                            });
                        }
                        inputs
                            .into_iter()
                            .enumerate()
                            .map(|(k, input)| {
                                let output = outputs.as_ref().map(|o| o[k].clone());
                                (self.rel(&input), output.map(|o| self.rel(&o)))
                            })
                            .collect()
                    }
                    _ => {
                        if matches!(tc.output, Some(FileSpec::Glob(_))) {
                            return Err(GraphError::Invalid {
                                field: format!("{field}.output"),
                                reason: "output cannot be a wildcard when input is not one"
                                    .to_string(),
                            });
                        }
                        vec![(String::new(), None)]
                    }
                };

                if tc.codename.is_some() && pairs.len() > 1 {
                    return Err(GraphError::Invalid {
                        field: format!("{field}.codename"),
                        reason: "an explicit codename cannot name multiple wildcard matches"
                            .to_string(),
                    });
                }

                for (input_text, output_text) in pairs {
                    seq += 1;
                    let codename = tc
                        .codename
                        .clone()
                        .unwrap_or_else(|| format!("{st}-{seq:02}"));

                    let input = if input_text.is_empty() {
                        self.resolve_spec(&tc.input, &format!("{field}.input"))?
                    } else {
                        self.path_source(&input_text, &format!("{field}.input"))?
                    };

                    let output = match (&tc.output, output_text) {
                        (_, Some(text)) => self.path_source(&text, &format!("{field}.output"))?,
                        (Some(spec), None) => {
                            self.resolve_spec(spec, &format!("{field}.output"))?
                        }
                        (None, None) => match sample_solution {
                            Some(sol) => self.sample_run(sol, input),
                            None => self.compile_tag(
                                &Tag {
                                    kind: TagKind::Raw,
                                    args: vec![TagArg::Str(String::new())],
                                },
                                &format!("{field}.output"),
                            )?,
                        },
                    };

                    if let Some(checker) = testcase_checker {
                        self.input_check(checker, input, st);
                    }

                    testcases.push(PlannedTestcase {
                        codename,
                        public: tc.public,
                        input,
                        output,
                    });
                }
            }

            subtasks.push(PlannedSubtask {
                points: subtask.points,
                public: subtask.public,
                testcases,
            });
        }

        Ok(subtasks)
    }

    /// Run the sample solution with the testcase input on stdin; the captured
    /// stdout becomes the expected output. This is an ordinary cached node,
    /// so regenerating outputs parallelizes and skips on cache hits.
    fn sample_run(&mut self, solution: Source, input: Source) -> Source {
        let canon = vec![self.token(solution), self.token(input)];
        let mut deps = Vec::new();
        let mut inputs = Vec::new();
        for source in [solution, input] {
            match source {
                Source::File(ix) => deps.push(ix),
                Source::Plain(i) => inputs.push(self.files[i].clone()),
            }
        }

        let id = self.node_id("samplesol", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Source::File(ix);
        }

        let argv = vec![self.plan_path(solution).to_string()];
        let stdin = Some(self.plan_path(input).to_owned());
        let out = self.out_path("samplesol", id, "");
        let ix = self.insert(BuildNode {
            id,
            kind: "samplesol",
            label: format!("samplesol {}", canon.join(" ")),
            canon,
            deps,
            inputs,
            out,
            work: Work::Command {
                argv,
                cwd: None,
                stdin,
                env: Vec::new(),
                artifact: Artifact::Stdout,
            },
        });
        Source::File(ix)
    }

    /// Validate one testcase input: `<checker> <subtask>` reads the input on
    /// stdin and must exit zero. The node has no consumer; it exists so a
    /// bad input fails the run.
    fn input_check(&mut self, checker: Source, input: Source, subtask: usize) -> Source {
        let canon = vec![
            subtask.to_string(),
            self.token(checker),
            self.token(input),
        ];
        let mut deps = Vec::new();
        let mut inputs = Vec::new();
        for source in [checker, input] {
            match source {
                Source::File(ix) => deps.push(ix),
                Source::Plain(i) => inputs.push(self.files[i].clone()),
            }
        }

        let id = self.node_id("inputcheck", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Source::File(ix);
        }

        let argv = vec![
            self.plan_path(checker).to_string(),
            subtask.to_string(),
        ];
        let stdin = Some(self.plan_path(input).to_owned());
        let out = self.out_path("inputcheck", id, ".ok");
        let ix = self.insert(BuildNode {
            id,
            kind: "inputcheck",
            label: format!("inputcheck {}", canon.join(" ")),
            canon,
            deps,
            inputs,
            out,
            work: Work::Command {
                argv,
                cwd: None,
                stdin,
                env: Vec::new(),
                artifact: Artifact::Stdout,
            },
        });
        Source::File(ix)
    }

    // ******************************
    // *       Tag compilation      *
    // ******************************

    fn compile_tag(&mut self, tag: &Tag, field: &str) -> Result<Source, GraphError> {
        let ix = match tag.kind {
            TagKind::LatexCompile => self.compile_latex(tag, field)?,
            TagKind::CppCompile => self.compile_cpp(tag, field)?,
            TagKind::CppRun => self.compile_cpprun(tag, field)?,
            TagKind::Shell => self.compile_shell(tag, field)?,
            TagKind::PyRun => self.compile_pyrun(tag, field)?,
            TagKind::Raw => self.compile_raw(tag, field)?,
            TagKind::PyInline => self.compile_pyinline(tag, field)?,
            TagKind::Zip => self.compile_zip(tag, field)?,
            TagKind::MdCompile => self.compile_md(tag, field)?,
            TagKind::Gunzip => self.compile_unpack(tag, field, TagKind::Gunzip)?,
            TagKind::XzUnzip => self.compile_unpack(tag, field, TagKind::XzUnzip)?,
        };
        Ok(Source::File(ix))
    }

    fn compile_latex(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let arg = str_arg(&tag.args[0], field)?;
        let tex = self.resolve_path(arg, field)?;

        let mut deps = Vec::new();
        let mut inputs = vec![tex.clone()];
        let extras = self.config.latex.additional_files.clone();
        for (i, extra) in extras.iter().enumerate() {
            let at = format!("latex_config.additional_files[{i}]");
            match self.resolve_ref(extra, &at)? {
                Source::File(ix) => deps.push(ix),
                Source::Plain(n) => inputs.push(self.files[n].clone()),
            }
        }

        let canon = vec![arg.to_string()];
        let id = self.node_id("latexcompile", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }

        let mut argv = self.latexmk_argv.clone();
        argv.push(tex.file_name().unwrap_or_default().to_string());
        let cwd = tex.parent().map(Utf8Path::to_owned);
        let artifact = Artifact::File(tex.with_extension("pdf"));
        let out = self.out_path("latexcompile", id, ".pdf");

        Ok(self.insert(BuildNode {
            id,
            kind: "latexcompile",
            label: format!("latexcompile {arg}"),
            canon,
            deps,
            inputs,
            out,
            work: Work::Command {
                argv,
                cwd,
                stdin: None,
                env: vec![("SOURCE_DATE_EPOCH".to_string(), "0".to_string())],
                artifact,
            },
        }))
    }

    fn compile_cpp(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let mut canon = Vec::new();
        let mut deps = Vec::new();
        let mut inputs = Vec::new();
        let mut sources = Vec::new();
        let mut flags = Vec::new();

        for arg in &tag.args {
            match arg {
                TagArg::Str(word) => {
                    canon.push(word.clone());
                    let suffix = Utf8Path::new(word).extension().unwrap_or_default();
                    match suffix {
                        "c" | "cc" | "cpp" | "cxx" => {
                            let path = self.resolve_path(word, field)?;
                            sources.push(path.to_string());
                            inputs.push(path);
                        }
                        "h" | "hpp" => {
                            let path = self.resolve_path(word, field)?;
                            inputs.push(path);
                        }
                        _ => flags.push(word.clone()),
                    }
                }
                TagArg::Tag(inner) => {
                    let ix = self.compile_node(inner, field)?;
                    sources.push(self.graph[ix].out.to_string());
                    deps.push(ix);
                }
            }
        }

        let id = self.node_id("cppcompile", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }
        let out = self.out_path("cppcompile", id, ".exec");

        let mut argv = vec!["g++".to_string()];
        argv.extend(self.gcc_argv.iter().cloned());
        argv.extend(flags);
        argv.extend(sources);
        argv.push("-o".to_string());
        argv.push(out.to_string());

        Ok(self.insert(BuildNode {
            id,
            kind: "cppcompile",
            label: label("cppcompile", &canon),
            canon,
            deps,
            inputs,
            out: out.clone(),
            work: Work::Command {
                argv,
                cwd: Some(self.root.to_owned()),
                stdin: None,
                env: Vec::new(),
                artifact: Artifact::File(out),
            },
        }))
    }

    fn compile_cpprun(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let mut canon = Vec::new();
        let mut deps = Vec::new();

        // The first argument names the program; it is compiled through an
        // implicit nested !cppcompile.
        let program = match &tag.args[0] {
            TagArg::Str(word) => {
                canon.push(word.clone());
                let compile = Tag {
                    kind: TagKind::CppCompile,
                    args: vec![TagArg::Str(word.clone())],
                };
                self.compile_node(&compile, field)?
            }
            TagArg::Tag(inner) => self.compile_node(inner, field)?,
        };
        deps.push(program);

        let mut rest = Vec::new();
        for arg in &tag.args[1..] {
            match arg {
                TagArg::Str(word) => {
                    canon.push(word.clone());
                    rest.push(word.clone());
                }
                TagArg::Tag(inner) => {
                    let ix = self.compile_node(inner, field)?;
                    rest.push(self.graph[ix].out.to_string());
                    deps.push(ix);
                }
            }
        }

        let id = self.node_id("cpprun", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }

        let mut argv = vec![self.graph[program].out.to_string()];
        argv.extend(rest);
        let seed = self.seed("cpprun", &canon, &deps);
        let out = self.out_path("cpprun", id, "");

        Ok(self.insert(BuildNode {
            id,
            kind: "cpprun",
            label: label("cpprun", &canon),
            canon,
            deps,
            inputs: Vec::new(),
            out,
            work: Work::Command {
                argv,
                cwd: None,
                stdin: None,
                env: vec![("TASKMILL_SEED".to_string(), seed.to_string())],
                artifact: Artifact::Stdout,
            },
        }))
    }

    fn compile_shell(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let mut canon = Vec::new();
        let mut deps = Vec::new();
        let mut inputs = Vec::new();
        let mut argv = Vec::new();

        for arg in &tag.args {
            match arg {
                TagArg::Str(word) => {
                    canon.push(word.clone());
                    argv.push(word.clone());
                    // Words naming existing files are tracked as inputs so
                    // the fingerprint sees their content.
                    let candidate = self.root.join(word);
                    if candidate.is_file() {
                        inputs.push(candidate);
                    }
                }
                TagArg::Tag(inner) => {
                    let ix = self.compile_node(inner, field)?;
                    argv.push(self.graph[ix].out.to_string());
                    deps.push(ix);
                }
            }
        }

        let id = self.node_id("shell", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }
        let out = self.out_path("shell", id, "");

        Ok(self.insert(BuildNode {
            id,
            kind: "shell",
            label: label("shell", &canon),
            canon,
            deps,
            inputs,
            out,
            work: Work::Command {
                argv,
                cwd: Some(self.root.to_owned()),
                stdin: None,
                env: Vec::new(),
                artifact: Artifact::Stdout,
            },
        }))
    }

    fn compile_pyrun(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let mut canon = Vec::new();
        let mut deps = Vec::new();
        let mut inputs = Vec::new();

        let script = match &tag.args[0] {
            TagArg::Str(word) => {
                canon.push(word.clone());
                let path = self.resolve_path(word, field)?;
                inputs.push(path.clone());
                path.to_string()
            }
            TagArg::Tag(inner) => {
                let ix = self.compile_node(inner, field)?;
                deps.push(ix);
                self.graph[ix].out.to_string()
            }
        };

        let mut rest = Vec::new();
        for arg in &tag.args[1..] {
            match arg {
                TagArg::Str(word) => {
                    canon.push(word.clone());
                    rest.push(word.clone());
                }
                TagArg::Tag(inner) => {
                    let ix = self.compile_node(inner, field)?;
                    rest.push(self.graph[ix].out.to_string());
                    deps.push(ix);
                }
            }
        }

        let id = self.node_id("pyrun", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }

        let mut argv = vec!["python3".to_string(), script];
        argv.extend(rest);
        let seed = self.seed("pyrun", &canon, &deps);
        let out = self.out_path("pyrun", id, ".txt");

        Ok(self.insert(BuildNode {
            id,
            kind: "pyrun",
            label: label("pyrun", &canon),
            canon,
            deps,
            inputs,
            out,
            work: Work::Command {
                argv,
                cwd: None,
                stdin: None,
                env: vec![("TASKMILL_SEED".to_string(), seed.to_string())],
                artifact: Artifact::Stdout,
            },
        }))
    }

    fn compile_raw(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let text = str_arg(&tag.args[0], field)?;
        let text = text.to_string();
        let canon = vec![text.clone()];
        let id = self.node_id("raw", &canon, &[]);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }
        let out = self.out_path("raw", id, ".txt");

        Ok(self.insert(BuildNode {
            id,
            kind: "raw",
            label: label("raw", &canon),
            canon,
            deps: Vec::new(),
            inputs: Vec::new(),
            out,
            work: Work::WriteText { text },
        }))
    }

    fn compile_pyinline(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let raw = Tag {
            kind: TagKind::Raw,
            args: tag.args.clone(),
        };
        let script = self.compile_raw(&raw, field)?;

        let canon = vec![self.graph[script].id.to_hex()];
        let deps = vec![script];
        let id = self.node_id("pyrun", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }

        let argv = vec![
            "python3".to_string(),
            self.graph[script].out.to_string(),
        ];
        let seed = self.seed("pyrun", &canon, &deps);
        let out = self.out_path("pyrun", id, ".txt");

        Ok(self.insert(BuildNode {
            id,
            kind: "pyrun",
            label: "pyinline".to_string(),
            canon,
            deps,
            inputs: Vec::new(),
            out,
            work: Work::Command {
                argv,
                cwd: None,
                stdin: None,
                env: vec![("TASKMILL_SEED".to_string(), seed.to_string())],
                artifact: Artifact::Stdout,
            },
        }))
    }

    fn compile_zip(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let mut canon = Vec::new();
        let mut deps = Vec::new();
        let mut inputs = Vec::new();
        let mut members = Vec::new();

        for arg in &tag.args {
            match arg {
                TagArg::Str(word) if word.contains(['*', '?', '[']) => {
                    for path in self.expand_glob(word, field)? {
                        canon.push(self.rel(&path));
                        members.push((file_name(&path), path.clone()));
                        inputs.push(path);
                    }
                }
                TagArg::Str(word) => {
                    canon.push(word.clone());
                    let (name, text) = match word.split_once('=') {
                        Some((name, path)) => (name.to_string(), path),
                        None => (file_name(Utf8Path::new(word)), word.as_str()),
                    };
                    let path = self.resolve_path(text, field)?;
                    members.push((name, path.clone()));
                    inputs.push(path);
                }
                TagArg::Tag(inner) => {
                    let ix = self.compile_node(inner, field)?;
                    members.push((file_name(&self.graph[ix].out), self.graph[ix].out.clone()));
                    deps.push(ix);
                }
            }
        }

        let id = self.node_id("zip", &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }
        let out = self.out_path("zip", id, ".zip");

        Ok(self.insert(BuildNode {
            id,
            kind: "zip",
            label: label("zip", &canon),
            canon,
            deps,
            inputs,
            out,
            work: Work::Zip { members },
        }))
    }

    fn compile_md(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        let arg = str_arg(&tag.args[0], field)?;
        let md = self.resolve_path(arg, field)?;

        let canon = vec![arg.to_string()];
        let id = self.node_id("mdcompile", &canon, &[]);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }
        let out = self.out_path("mdcompile", id, ".html");

        let resource_path = md.parent().unwrap_or(self.root).to_string();
        let argv = vec![
            "pandoc".to_string(),
            "--katex".to_string(),
            "--embed-resources".to_string(),
            "--highlight-style=pygments".to_string(),
            "--html-q-tags".to_string(),
            format!("--resource-path={resource_path}"),
            md.to_string(),
            "-o".to_string(),
            out.to_string(),
        ];

        Ok(self.insert(BuildNode {
            id,
            kind: "mdcompile",
            label: format!("mdcompile {arg}"),
            canon,
            deps: Vec::new(),
            inputs: vec![md],
            out: out.clone(),
            work: Work::Command {
                argv,
                cwd: Some(self.root.to_owned()),
                stdin: None,
                env: Vec::new(),
                artifact: Artifact::File(out),
            },
        }))
    }

    fn compile_unpack(
        &mut self,
        tag: &Tag,
        field: &str,
        kind: TagKind,
    ) -> Result<NodeIndex, GraphError> {
        let mut deps = Vec::new();
        let mut inputs = Vec::new();
        let (canon_token, src) = match &tag.args[0] {
            TagArg::Str(word) => {
                let path = self.resolve_path(word, field)?;
                inputs.push(path.clone());
                (word.clone(), path)
            }
            TagArg::Tag(inner) => {
                let ix = self.compile_node(inner, field)?;
                deps.push(ix);
                (self.graph[ix].id.to_hex(), self.graph[ix].out.clone())
            }
        };

        let kind_name = if kind == TagKind::Gunzip {
            "gunzip"
        } else {
            "xzunzip"
        };
        let canon = vec![canon_token];
        let id = self.node_id(kind_name, &canon, &deps);
        if let Some(&ix) = self.memo.get(&id) {
            return Ok(ix);
        }
        let out = self.out_path(kind_name, id, ".txt");

        let work = if kind == TagKind::Gunzip {
            Work::Gunzip { src }
        } else {
            Work::Command {
                argv: vec!["xz".to_string(), "-dc".to_string()],
                cwd: Some(self.root.to_owned()),
                stdin: Some(src),
                env: Vec::new(),
                artifact: Artifact::Stdout,
            }
        };

        Ok(self.insert(BuildNode {
            id,
            kind: kind_name,
            label: label(kind_name, &canon),
            canon,
            deps,
            inputs,
            out,
            work,
        }))
    }

    // ******************************
    // *          Helpers           *
    // ******************************

    fn compile_node(&mut self, tag: &Tag, field: &str) -> Result<NodeIndex, GraphError> {
        match self.compile_tag(tag, field)? {
            Source::File(ix) => Ok(ix),
            Source::Plain(_) => unreachable!("tags always compile to nodes"),
        }
    }

    fn resolve_ref(&mut self, file: &FileRef, field: &str) -> Result<Source, GraphError> {
        match file {
            FileRef::Path(text) => {
                let abs = self.resolve_path(text, field)?;
                Ok(self.plain(abs))
            }
            FileRef::Tag(tag) => self.compile_tag(tag, field),
        }
    }

    fn resolve_spec(&mut self, spec: &FileSpec, field: &str) -> Result<Source, GraphError> {
        match spec {
            FileSpec::Path(text) => self.path_source(text, field),
            FileSpec::Tag(tag) => self.compile_tag(tag, field),
            FileSpec::Glob(pattern) => Err(GraphError::Invalid {
                field: field.to_string(),
                reason: format!("unexpected wildcard `{pattern}` in this position"),
            }),
        }
    }

    /// A testcase file given by path; `.gz`/`.xz` suffixes implicitly wrap
    /// the file in a decompression node.
    fn path_source(&mut self, text: &str, field: &str) -> Result<Source, GraphError> {
        let kind = if text.ends_with(".gz") {
            Some(TagKind::Gunzip)
        } else if text.ends_with(".xz") {
            Some(TagKind::XzUnzip)
        } else {
            None
        };

        match kind {
            Some(kind) => {
                let tag = Tag {
                    kind,
                    args: vec![TagArg::Str(text.to_string())],
                };
                self.compile_tag(&tag, field)
            }
            None => {
                let abs = self.resolve_path(text, field)?;
                Ok(self.plain(abs))
            }
        }
    }

    fn resolve_path(&self, text: &str, field: &str) -> Result<Utf8PathBuf, GraphError> {
        let abs = self.root.join(text);
        if abs.is_file() {
            Ok(abs)
        } else {
            Err(GraphError::MissingFile {
                field: field.to_string(),
                path: abs,
            })
        }
    }

    /// Expand a wildcard relative to the task root. Matches are sorted
    /// lexicographically for determinism; zero matches is an error.
    fn expand_glob(&self, pattern: &str, field: &str) -> Result<Vec<Utf8PathBuf>, GraphError> {
        let full = self.root.join(pattern);
        let walker = glob::glob(full.as_str()).map_err(|source| GraphError::BadPattern {
            field: field.to_string(),
            pattern: pattern.to_string(),
            source,
        })?;

        let mut matches = Vec::new();
        for entry in walker {
            let path = entry.map_err(|err| GraphError::Invalid {
                field: field.to_string(),
                reason: format!("couldn't read glob match: {err}"),
            })?;
            let path = Utf8PathBuf::from_path_buf(path).map_err(|path| GraphError::Invalid {
                field: field.to_string(),
                reason: format!("glob match {} is not valid UTF-8", path.display()),
            })?;
            if path.is_file() {
                matches.push(path);
            }
        }
        matches.sort();

        if matches.is_empty() {
            return Err(GraphError::EmptyGlob {
                field: field.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(matches)
    }

    fn plain(&mut self, path: Utf8PathBuf) -> Source {
        if let Some(i) = self.files.iter().position(|p| p == &path) {
            return Source::Plain(i);
        }
        self.files.push(path);
        Source::Plain(self.files.len() - 1)
    }

    fn plan_path(&self, source: Source) -> &Utf8Path {
        match source {
            Source::File(ix) => &self.graph[ix].out,
            Source::Plain(i) => &self.files[i],
        }
    }

    fn token(&self, source: Source) -> String {
        match source {
            Source::File(ix) => self.graph[ix].id.to_hex(),
            Source::Plain(i) => self.rel(&self.files[i]),
        }
    }

    fn source_name(&self, source: Source) -> String {
        file_name(self.plan_path(source))
    }

    fn rel(&self, path: &Utf8Path) -> String {
        path.strip_prefix(self.root)
            .map(|p| p.to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    fn node_id(&self, kind: &str, canon: &[String], deps: &[NodeIndex]) -> NodeId {
        let mut hasher = Blake3Hasher::default();
        hasher.push(kind);
        for arg in canon {
            hasher.push(arg);
        }
        for &dep in deps {
            hasher.push(self.graph[dep].id.0.as_bytes());
        }
        NodeId(hasher.finish())
    }

    /// Stable per-rule seed so generator programs are deterministic across
    /// machines and runs.
    fn seed(&self, kind: &str, canon: &[String], deps: &[NodeIndex]) -> u32 {
        self.node_id(kind, canon, deps).0.prefix_u32()
    }

    fn out_path(&self, kind: &str, id: NodeId, ext: &str) -> Utf8PathBuf {
        self.build_dir.join(format!("{kind}_{}{ext}", id.short()))
    }

    fn insert(&mut self, node: BuildNode) -> NodeIndex {
        let id = node.id;
        let deps = node.deps.clone();
        let ix = self.graph.add_node(node);
        for dep in deps {
            self.graph.add_edge(dep, ix, ());
        }
        self.memo.insert(id, ix);
        ix
    }
}

fn split_args(text: &str, field: &str) -> Result<Vec<String>, GraphError> {
    shlex::split(text).ok_or_else(|| GraphError::Invalid {
        field: field.to_string(),
        reason: format!("unbalanced quoting in `{text}`"),
    })
}

fn str_arg<'a>(arg: &'a TagArg, field: &str) -> Result<&'a str, GraphError> {
    match arg {
        TagArg::Str(s) => Ok(s),
        TagArg::Tag(_) => Err(GraphError::Invalid {
            field: field.to_string(),
            reason: "this argument must be a path, not a nested tag".to_string(),
        }),
    }
}

fn file_name(path: &Utf8Path) -> String {
    path.file_name().unwrap_or_default().to_string()
}

fn label(kind: &str, canon: &[String]) -> String {
    let mut text = format!("{kind} {}", canon.join(" ").replace('\n', " "));
    if text.len() > 48 {
        let cut = (0..=48).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
        text.truncate(cut);
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use std::fs;

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

    fn plan_for(root: &Utf8Path, yaml: &str) -> BuildPlan {
        fs::write(root.join(config::TASK_FILE), yaml).unwrap();
        let cfg = config::load(root).unwrap();
        compile(&cfg, root).unwrap()
    }

    fn plan_err(root: &Utf8Path, yaml: &str) -> GraphError {
        fs::write(root.join(config::TASK_FILE), yaml).unwrap();
        let cfg = config::load(root).unwrap();
        compile(&cfg, root).unwrap_err()
    }

    fn count_kind(plan: &BuildPlan, kind: &str) -> usize {
        plan.graph
            .node_indices()
            .filter(|&ix| plan.graph[ix].kind == kind)
            .count()
    }

    #[test]
    fn identical_tags_compile_to_one_node() {
        let (_guard, root) = scratch();
        fs::write(root.join("grader.cpp"), "int main() {}").unwrap();
        let yaml = format!(
            "{BASE}\
grader:
  - !cppcompile grader.cpp
attachments:
  grader: !cppcompile grader.cpp
subtasks:
  - points: 100
    testcases:
      - input: !raw '1'
        output: !raw '2'
"
        );

        let plan = plan_for(&root, &yaml);
        assert_eq!(count_kind(&plan, "cppcompile"), 1);
    }

    #[test]
    fn wildcards_pair_positionally_in_sorted_order() {
        let (_guard, root) = scratch();
        fs::create_dir(root.join("tc")).unwrap();
        for name in ["1-02.in", "1-01.in", "1-01.out", "1-02.out"] {
            fs::write(root.join("tc").join(name), name).unwrap();
        }
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: tc/1-*.in
        output: tc/1-*.out
"
        );

        let plan = plan_for(&root, &yaml);
        let tcs = &plan.subtasks[0].testcases;
        assert_eq!(tcs.len(), 2);
        assert_eq!(tcs[0].codename, "1-01");
        assert_eq!(tcs[1].codename, "1-02");
        assert!(plan.path_of(tcs[0].input).as_str().ends_with("1-01.in"));
        assert!(plan.path_of(tcs[0].output).as_str().ends_with("1-01.out"));
        assert!(plan.path_of(tcs[1].input).as_str().ends_with("1-02.in"));
    }

    #[test]
    fn mismatched_wildcard_counts_fail() {
        let (_guard, root) = scratch();
        fs::create_dir(root.join("tc")).unwrap();
        for name in ["1-01.in", "1-02.in", "1-01.out"] {
            fs::write(root.join("tc").join(name), name).unwrap();
        }
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: tc/1-*.in
        output: tc/1-*.out
"
        );

        let err = plan_err(&root, &yaml);
        assert!(
            matches!(err, GraphError::GlobMismatch { inputs: 2, outputs: 1, .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn empty_wildcard_fails() {
        let (_guard, root) = scratch();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: tc/*.in
"
        );

        let err = plan_err(&root, &yaml);
        assert!(matches!(err, GraphError::EmptyGlob { .. }), "got {err:?}");
    }

    #[test]
    fn gz_inputs_are_wrapped_in_decompression_nodes() {
        let (_guard, root) = scratch();
        fs::write(root.join("big.in.gz"), b"\x1f\x8b").unwrap();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: big.in.gz
        output: !raw 'expected'
"
        );

        let plan = plan_for(&root, &yaml);
        assert_eq!(count_kind(&plan, "gunzip"), 1);
        let tc = &plan.subtasks[0].testcases[0];
        assert!(matches!(tc.input, Source::File(_)));
    }

    #[test]
    fn missing_output_compiles_a_sample_solution_chain() {
        let (_guard, root) = scratch();
        fs::write(root.join("sol.cpp"), "int main() {}").unwrap();
        fs::write(root.join("case.in"), "1 2\n").unwrap();
        let yaml = format!(
            "{BASE}\
sample_solution: !cppcompile sol.cpp
subtasks:
  - points: 100
    testcases:
      - input: case.in
"
        );

        let plan = plan_for(&root, &yaml);
        assert_eq!(count_kind(&plan, "cppcompile"), 1);
        assert_eq!(count_kind(&plan, "samplesol"), 1);

        // The run node depends on the compiled solution.
        let run = plan
            .graph
            .node_indices()
            .find(|&ix| plan.graph[ix].kind == "samplesol")
            .unwrap();
        let dep_kinds: Vec<_> = plan.graph[run]
            .deps
            .iter()
            .map(|&d| plan.graph[d].kind)
            .collect();
        assert_eq!(dep_kinds, vec!["cppcompile"]);
        assert_eq!(plan.subtasks[0].testcases[0].output, Source::File(run));
    }

    #[test]
    fn missing_output_without_solution_becomes_empty() {
        let (_guard, root) = scratch();
        fs::write(root.join("case.in"), "1 2\n").unwrap();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: case.in
"
        );

        let plan = plan_for(&root, &yaml);
        assert_eq!(count_kind(&plan, "raw"), 2); // statement + empty output
    }

    #[test]
    fn testcase_checker_nodes_are_created_per_input() {
        let (_guard, root) = scratch();
        fs::write(root.join("check.py"), "#").unwrap();
        fs::write(root.join("a.in"), "a").unwrap();
        fs::write(root.join("b.in"), "b").unwrap();
        let yaml = format!(
            "{BASE}\
testcase_checker: check.py
subtasks:
  - points: 100
    testcases:
      - input: a.in
        output: !raw 'x'
      - input: b.in
        output: !raw 'y'
"
        );

        let plan = plan_for(&root, &yaml);
        assert_eq!(count_kind(&plan, "inputcheck"), 2);
    }

    #[test]
    fn node_ids_are_deterministic() {
        let (_guard, root) = scratch();
        fs::write(root.join("gen.py"), "print(1)").unwrap();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: !pyrun 'gen.py 7'
        output: !raw 'out'
"
        );

        let a = plan_for(&root, &yaml);
        let b = plan_for(&root, &yaml);
        let mut ids_a: Vec<_> = a.graph.node_indices().map(|ix| a.graph[ix].id.to_hex()).collect();
        let mut ids_b: Vec<_> = b.graph.node_indices().map(|ix| b.graph[ix].id.to_hex()).collect();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn missing_file_is_a_graph_error() {
        let (_guard, root) = scratch();
        let yaml = format!(
            "{BASE}\
subtasks:
  - points: 100
    testcases:
      - input: nope.in
"
        );

        let err = plan_err(&root, &yaml);
        assert!(matches!(err, GraphError::MissingFile { .. }), "got {err:?}");
    }
}
