//! Build orchestration.
//!
//! The orchestrator drives the dependency graph with a bounded pool of
//! toolchain workers. Workers report back over a channel; only the
//! coordinator touches the status table, so no unit status is ever written
//! from two places. A failing unit blocks its dependents but leaves
//! independent branches running, unless fail-fast is requested.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::config::{BuildConfig, ConfigError};
use crate::graph::{BuildUnit, DependencyGraph, GraphError, UnitKind, UnitStatus};
use crate::toolchain::{CancelFlag, Invocation, InvokeOutcome};

/// What to do with the rest of the build when a unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Let independent in-flight branches finish (default).
    BestEffort,
    /// Stop dispatching immediately; optionally kill in-flight processes.
    FailFast { kill_in_flight: bool },
}

/// When an existing output may be reused instead of rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebuildPolicy {
    #[default]
    Always,
    /// Output newer than every input.
    Mtime,
    /// Input bytes hash to the value recorded beside the output.
    Crc32,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Maximum concurrent toolchain processes, at least 1.
    pub jobs: usize,
    pub fail_mode: FailMode,
    pub rebuild: RebuildPolicy,
    /// Per-invocation timeout.
    pub timeout: Option<Duration>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            fail_mode: FailMode::BestEffort,
            rebuild: RebuildPolicy::Always,
            timeout: None,
        }
    }
}

/// Status-change notifications delivered while a build runs.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    StatusChanged {
        unit: PathBuf,
        kind: UnitKind,
        status: UnitStatus,
    },
    /// The output was fresh under the rebuild policy; no process ran.
    Skipped { unit: PathBuf },
}

#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: PathBuf,
    pub kind: UnitKind,
    pub diagnostics: String,
}

/// Terminal result of a build run.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<UnitFailure>,
    pub blocked: Vec<PathBuf>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty()
    }
}

/// Fatal errors detected before any process is spawned.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Where the object file for a source unit lands.
pub fn object_path(out_dir: &Path, source: &Path) -> PathBuf {
    let stem = source.file_stem().unwrap_or(source.as_os_str());
    out_dir.join(stem).with_extension("o")
}

/// Builds the graph for a discovered source list: one object per source,
/// one linked image depending on every object.
pub fn plan_graph(
    sources: &[(PathBuf, UnitKind)],
    out_dir: &Path,
    image_out: &Path,
) -> Result<DependencyGraph, BuildError> {
    let mut graph = DependencyGraph::new();
    let mut objects = Vec::with_capacity(sources.len());
    for (source, kind) in sources {
        debug_assert!(kind.is_source());
        graph.add_unit(source.clone(), *kind)?;
        let object = object_path(out_dir, source);
        if let Err(GraphError::DuplicateUnit(path)) = graph.add_unit(object.clone(), UnitKind::Object)
        {
            return Err(ConfigError::DuplicateOutput(path).into());
        }
        graph.add_dependency(&object, source)?;
        objects.push(object);
    }
    if let Err(GraphError::DuplicateUnit(path)) =
        graph.add_unit(image_out.to_path_buf(), UnitKind::LinkedImage)
    {
        return Err(ConfigError::DuplicateOutput(path).into());
    }
    for object in &objects {
        graph.add_dependency(image_out, object)?;
    }
    Ok(graph)
}

struct Completion {
    unit: PathBuf,
    kind: UnitKind,
    outcome: InvokeOutcome,
}

pub struct BuildOrchestrator {
    graph: DependencyGraph,
    config: BuildConfig,
    options: BuildOptions,
}

impl BuildOrchestrator {
    pub fn new(graph: DependencyGraph, config: BuildConfig, options: BuildOptions) -> Self {
        Self {
            graph,
            config,
            options,
        }
    }

    /// Runs the build to completion. Status changes go out on `events`;
    /// the aggregated report is the terminal value. A configuration
    /// problem or dependency cycle aborts with zero processes spawned.
    pub fn run(&self, events: &Sender<BuildEvent>) -> Result<BuildReport, BuildError> {
        self.config.validate()?;
        self.validate_units()?;
        self.graph.topological_order()?;

        let jobs = self.options.jobs.max(1);
        let mut statuses: IndexMap<PathBuf, UnitStatus> = self
            .graph
            .units()
            .map(|u| (u.path.clone(), UnitStatus::Pending))
            .collect();
        let (done_tx, done_rx) = unbounded::<Completion>();
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let mut failures: Vec<UnitFailure> = Vec::new();
        let mut running = 0usize;
        let mut halted = false;

        loop {
            // resolve sources and dispatch process units until nothing moves
            let mut progressed = true;
            while progressed && !halted {
                progressed = false;
                let frontier: Vec<(PathBuf, UnitKind)> = self
                    .graph
                    .ready_frontier(&statuses)
                    .iter()
                    .map(|u| (u.path.clone(), u.kind))
                    .collect();
                for (path, kind) in frontier {
                    if halted {
                        break;
                    }
                    if kind.is_source() {
                        progressed = true;
                        if path.is_file() {
                            set_status(&mut statuses, events, &path, kind, UnitStatus::Succeeded);
                        } else {
                            failures.push(UnitFailure {
                                unit: path.clone(),
                                kind,
                                diagnostics: format!("source file not found: {}", path.display()),
                            });
                            set_status(&mut statuses, events, &path, kind, UnitStatus::Failed);
                            self.fail_downstream(&path, &mut statuses, events, &cancel, &mut halted);
                        }
                        continue;
                    }
                    if running >= jobs {
                        continue;
                    }
                    let Some(unit) = self.graph.get(&path) else {
                        continue;
                    };
                    if self.is_fresh(unit) {
                        let _ = events.send(BuildEvent::Skipped { unit: path.clone() });
                        set_status(&mut statuses, events, &path, kind, UnitStatus::Succeeded);
                        progressed = true;
                        continue;
                    }
                    let invocation = self.invocation_for(unit)?;
                    set_status(&mut statuses, events, &path, kind, UnitStatus::Queued);
                    let tx = done_tx.clone();
                    let worker_cancel = cancel.clone();
                    let unit_path = path.clone();
                    thread::spawn(move || {
                        let outcome = invocation.run(&worker_cancel);
                        let _ = tx.send(Completion {
                            unit: unit_path,
                            kind,
                            outcome,
                        });
                    });
                    running += 1;
                    set_status(&mut statuses, events, &path, kind, UnitStatus::Running);
                    progressed = true;
                }
            }

            if running == 0 {
                break;
            }

            let Ok(done) = done_rx.recv() else {
                break;
            };
            running -= 1;
            if done.outcome.is_success() {
                let diagnostics = done.outcome.diagnostics();
                if !diagnostics.trim().is_empty() {
                    debug!(unit = %done.unit.display(), "{diagnostics}");
                }
                if self.options.rebuild == RebuildPolicy::Crc32 {
                    if let Some(unit) = self.graph.get(&done.unit) {
                        record_crc(unit);
                    }
                }
                set_status(&mut statuses, events, &done.unit, done.kind, UnitStatus::Succeeded);
            } else {
                failures.push(UnitFailure {
                    unit: done.unit.clone(),
                    kind: done.kind,
                    diagnostics: done.outcome.diagnostics().to_string(),
                });
                set_status(&mut statuses, events, &done.unit, done.kind, UnitStatus::Failed);
                self.fail_downstream(&done.unit, &mut statuses, events, &cancel, &mut halted);
            }
        }

        // fail-fast leftovers were never started
        let leftover: Vec<(PathBuf, UnitKind)> = statuses
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(path, _)| {
                let kind = self
                    .graph
                    .get(path)
                    .map(|u| u.kind)
                    .unwrap_or(UnitKind::Object);
                (path.clone(), kind)
            })
            .collect();
        for (path, kind) in leftover {
            set_status(&mut statuses, events, &path, kind, UnitStatus::Blocked);
        }

        let mut report = BuildReport {
            failed: failures,
            ..BuildReport::default()
        };
        for (path, status) in &statuses {
            match status {
                UnitStatus::Succeeded => report.succeeded.push(path.clone()),
                UnitStatus::Blocked => report.blocked.push(path.clone()),
                _ => {}
            }
        }
        Ok(report)
    }

    /// Every non-source unit must have usable inputs before anything runs.
    fn validate_units(&self) -> Result<(), BuildError> {
        for unit in self.graph.units() {
            let ok = match unit.kind {
                UnitKind::Object => unit
                    .deps
                    .iter()
                    .any(|d| self.graph.get(d).is_some_and(|u| u.kind.is_source())),
                UnitKind::LinkedImage => !unit.deps.is_empty(),
                UnitKind::CSource | UnitKind::AsmSource => true,
            };
            if !ok {
                return Err(ConfigError::MissingInputs(unit.path.clone()).into());
            }
        }
        Ok(())
    }

    fn invocation_for(&self, unit: &BuildUnit) -> Result<Invocation, BuildError> {
        let timeout = self.options.timeout;
        match unit.kind {
            UnitKind::Object => {
                let source = unit
                    .deps
                    .iter()
                    .find_map(|d| self.graph.get(d).filter(|u| u.kind.is_source()))
                    .ok_or_else(|| ConfigError::MissingInputs(unit.path.clone()))?;
                Ok(match source.kind {
                    UnitKind::CSource => {
                        Invocation::compile(&self.config, &source.path, &unit.path, timeout)
                    }
                    _ => Invocation::assemble(&self.config, &source.path, &unit.path, timeout),
                })
            }
            UnitKind::LinkedImage => Ok(Invocation::link(
                &self.config,
                &unit.deps,
                &unit.path,
                timeout,
            )),
            UnitKind::CSource | UnitKind::AsmSource => {
                Err(ConfigError::MissingInputs(unit.path.clone()).into())
            }
        }
    }

    fn fail_downstream(
        &self,
        failed: &Path,
        statuses: &mut IndexMap<PathBuf, UnitStatus>,
        events: &Sender<BuildEvent>,
        cancel: &CancelFlag,
        halted: &mut bool,
    ) {
        for dependent in self.graph.transitive_dependents(failed) {
            let current = statuses.get(&dependent).copied();
            if matches!(current, Some(UnitStatus::Pending) | Some(UnitStatus::Queued)) {
                let kind = self
                    .graph
                    .get(&dependent)
                    .map(|u| u.kind)
                    .unwrap_or(UnitKind::Object);
                set_status(statuses, events, &dependent, kind, UnitStatus::Blocked);
            }
        }
        if let FailMode::FailFast { kill_in_flight } = self.options.fail_mode {
            *halted = true;
            if kill_in_flight {
                cancel.store(true, Ordering::Relaxed);
            }
        }
    }

    fn is_fresh(&self, unit: &BuildUnit) -> bool {
        match self.options.rebuild {
            RebuildPolicy::Always => false,
            RebuildPolicy::Mtime => mtime_fresh(&unit.path, &unit.deps),
            RebuildPolicy::Crc32 => crc_fresh(&unit.path, &unit.deps),
        }
    }
}

fn set_status(
    statuses: &mut IndexMap<PathBuf, UnitStatus>,
    events: &Sender<BuildEvent>,
    unit: &Path,
    kind: UnitKind,
    status: UnitStatus,
) {
    statuses.insert(unit.to_path_buf(), status);
    let _ = events.send(BuildEvent::StatusChanged {
        unit: unit.to_path_buf(),
        kind,
        status,
    });
}

fn mtime_fresh(output: &Path, inputs: &[PathBuf]) -> bool {
    let Ok(out_time) = fs::metadata(output).and_then(|m| m.modified()) else {
        return false;
    };
    !inputs.is_empty()
        && inputs.iter().all(|input| {
            fs::metadata(input)
                .and_then(|m| m.modified())
                .map(|t| t <= out_time)
                .unwrap_or(false)
        })
}

fn input_crc(inputs: &[PathBuf]) -> Option<u32> {
    let mut hasher = crc32fast::Hasher::new();
    for input in inputs {
        hasher.update(&fs::read(input).ok()?);
    }
    Some(hasher.finalize())
}

fn crc_sidecar(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".crc");
    PathBuf::from(name)
}

fn crc_fresh(output: &Path, inputs: &[PathBuf]) -> bool {
    if !output.exists() {
        return false;
    }
    let Ok(recorded) = fs::read_to_string(crc_sidecar(output)) else {
        return false;
    };
    match (u32::from_str_radix(recorded.trim(), 16), input_crc(inputs)) {
        (Ok(recorded), Some(current)) => recorded == current,
        _ => false,
    }
}

fn record_crc(unit: &BuildUnit) {
    if let Some(crc) = input_crc(&unit.deps) {
        if let Err(err) = fs::write(crc_sidecar(&unit.path), format!("{crc:08x}\n")) {
            debug!(unit = %unit.path.display(), "could not record input hash: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AsOptions, CcOptions, LdOptions};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Stub toolchain: the compiler copies its input (failing on BROKEN
    /// sources), the assembler copies, the linker concatenates.
    fn stub_config(root: &Path) -> BuildConfig {
        write_tool(
            root,
            "cc.sh",
            r#"in="$2"; out="$4"
if grep -q BROKEN "$in" 2>/dev/null; then echo "error: unit failed" >&2; exit 1; fi
cp "$in" "$out""#,
        );
        write_tool(root, "as.sh", r#"out="$2"; in="$3"; cp "$in" "$out""#);
        write_tool(root, "ld.sh", r#"out="$4"; shift 4; cat "$@" > "$out""#);
        let mut config = BuildConfig::release(root);
        config.cc = CcOptions {
            include_paths: vec![],
            defines: vec![],
            flags: vec![],
            cc_path: PathBuf::from("cc.sh"),
        };
        config.asm = AsOptions {
            defines: vec![],
            flags: vec![],
            as_path: PathBuf::from("as.sh"),
        };
        config.ld = LdOptions {
            linker_script: PathBuf::from("md.ld"),
            flags: vec![],
            libraries: vec![],
            ld_path: PathBuf::from("ld.sh"),
        };
        config
    }

    struct Project {
        tmp: TempDir,
        sources: Vec<(PathBuf, UnitKind)>,
        out_dir: PathBuf,
        image: PathBuf,
    }

    fn project(files: &[(&str, &str)]) -> Project {
        let tmp = TempDir::new().unwrap();
        let src_dir = tmp.path().join("src");
        let out_dir = tmp.path().join("out");
        fs::create_dir_all(&src_dir).unwrap();
        fs::create_dir_all(&out_dir).unwrap();
        let mut sources = Vec::new();
        for (name, content) in files {
            let path = src_dir.join(name);
            fs::write(&path, content).unwrap();
            let kind = if name.ends_with(".s") {
                UnitKind::AsmSource
            } else {
                UnitKind::CSource
            };
            sources.push((path, kind));
        }
        let image = out_dir.join("rom_body.bin");
        Project {
            tmp,
            sources,
            out_dir,
            image,
        }
    }

    fn run_build(project: &Project, options: BuildOptions) -> (BuildReport, Vec<BuildEvent>) {
        let graph = plan_graph(&project.sources, &project.out_dir, &project.image).unwrap();
        let config = stub_config(project.tmp.path());
        let orchestrator = BuildOrchestrator::new(graph, config, options);
        let (tx, rx) = unbounded();
        let report = orchestrator.run(&tx).unwrap();
        (report, rx.try_iter().collect())
    }

    fn statuses_of(events: &[BuildEvent], unit: &Path) -> Vec<UnitStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::StatusChanged { unit: u, status, .. } if u == unit => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plan_graph_shape() {
        let project = project(&[("a.c", "alpha"), ("boot.s", "boot")]);
        let graph = plan_graph(&project.sources, &project.out_dir, &project.image).unwrap();
        assert_eq!(graph.len(), 5);
        let image = graph.get(&project.image).unwrap();
        assert_eq!(image.kind, UnitKind::LinkedImage);
        assert_eq!(image.deps.len(), 2);
        let object = graph.get(&project.out_dir.join("a.o")).unwrap();
        assert_eq!(object.deps, vec![project.sources[0].0.clone()]);
    }

    #[test]
    fn plan_graph_rejects_colliding_outputs() {
        let tmp = TempDir::new().unwrap();
        let sources = vec![
            (tmp.path().join("src/a.c"), UnitKind::CSource),
            (tmp.path().join("src/a.s"), UnitKind::AsmSource),
        ];
        let out = tmp.path().join("out");
        let err = plan_graph(&sources, &out, &out.join("rom_body.bin")).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Config(ConfigError::DuplicateOutput(_))
        ));
    }

    #[test]
    fn full_build_succeeds_and_links_in_order() {
        let project = project(&[("a.c", "alpha\n"), ("b.c", "beta\n"), ("boot.s", "boot\n")]);
        let (report, events) = run_build(
            &project,
            BuildOptions {
                jobs: 4,
                ..BuildOptions::default()
            },
        );
        assert!(report.success(), "failures: {:?}", report.failed);
        assert_eq!(report.succeeded.len(), 7);
        let body = fs::read(&project.image).unwrap();
        assert_eq!(body, b"alpha\nbeta\nboot\n");
        // the image only started once every object was done
        let image_events = statuses_of(&events, &project.image);
        assert_eq!(
            image_events,
            vec![
                UnitStatus::Queued,
                UnitStatus::Running,
                UnitStatus::Succeeded
            ]
        );
    }

    #[test]
    fn failing_unit_blocks_dependents_but_not_siblings() {
        let project = project(&[("a.c", "alpha\n"), ("b.c", "BROKEN\n")]);
        let (report, _) = run_build(&project, BuildOptions::default());
        assert!(!report.success());
        let b_object = project.out_dir.join("b.o");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].unit, b_object);
        assert!(report.failed[0].diagnostics.contains("error: unit failed"));
        assert!(report.blocked.contains(&project.image));
        assert!(report.succeeded.contains(&project.out_dir.join("a.o")));
        assert!(project.out_dir.join("a.o").exists());
        assert!(!project.image.exists());
    }

    #[test]
    fn missing_source_fails_and_blocks_dependents() {
        let project = project(&[("a.c", "alpha\n")]);
        let mut sources = project.sources.clone();
        sources.push((project.tmp.path().join("src/ghost.c"), UnitKind::CSource));
        let graph = plan_graph(&sources, &project.out_dir, &project.image).unwrap();
        let config = stub_config(project.tmp.path());
        let orchestrator = BuildOrchestrator::new(graph, config, BuildOptions::default());
        let (tx, rx) = unbounded();
        let report = orchestrator.run(&tx).unwrap();
        drop(rx);
        assert!(!report.success());
        assert!(report.failed[0].diagnostics.contains("source file not found"));
        assert!(report.blocked.contains(&project.out_dir.join("ghost.o")));
        assert!(report.blocked.contains(&project.image));
    }

    #[test]
    fn cycle_aborts_with_zero_dispatches() {
        let project = project(&[("a.c", "alpha\n")]);
        let mut graph = plan_graph(&project.sources, &project.out_dir, &project.image).unwrap();
        let a_object = project.out_dir.join("a.o");
        graph.add_dependency(&a_object, &project.image).unwrap();
        let config = stub_config(project.tmp.path());
        let orchestrator = BuildOrchestrator::new(graph, config, BuildOptions::default());
        let (tx, _rx) = unbounded();
        let err = orchestrator.run(&tx).unwrap_err();
        assert!(matches!(err, BuildError::Graph(GraphError::Cycle(_))));
        assert!(!a_object.exists());
        assert!(!project.image.exists());
    }

    #[test]
    fn fail_fast_never_starts_remaining_units() {
        let project = project(&[("bad.c", "BROKEN\n"), ("good.c", "fine\n")]);
        let (report, _) = run_build(
            &project,
            BuildOptions {
                jobs: 1,
                fail_mode: FailMode::FailFast {
                    kill_in_flight: false,
                },
                ..BuildOptions::default()
            },
        );
        assert!(!report.success());
        let good_object = project.out_dir.join("good.o");
        assert!(!good_object.exists());
        assert!(report.blocked.contains(&good_object));
        assert!(report.blocked.contains(&project.image));
    }

    #[test]
    fn mtime_policy_skips_fresh_outputs() {
        let project = project(&[("a.c", "alpha\n"), ("b.c", "beta\n")]);
        let (report, _) = run_build(&project, BuildOptions::default());
        assert!(report.success());

        let (report, events) = run_build(
            &project,
            BuildOptions {
                rebuild: RebuildPolicy::Mtime,
                ..BuildOptions::default()
            },
        );
        assert!(report.success());
        let skipped: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::Skipped { unit } => Some(unit.clone()),
                _ => None,
            })
            .collect();
        assert!(skipped.contains(&project.out_dir.join("a.o")));
        assert!(skipped.contains(&project.image));
    }

    #[test]
    fn crc_policy_rebuilds_only_changed_inputs() {
        let project = project(&[("a.c", "alpha\n"), ("b.c", "beta\n")]);
        let options = BuildOptions {
            rebuild: RebuildPolicy::Crc32,
            ..BuildOptions::default()
        };
        let (report, _) = run_build(&project, options.clone());
        assert!(report.success());

        // untouched inputs: everything is fresh
        let (_, events) = run_build(&project, options.clone());
        let skipped = events
            .iter()
            .filter(|e| matches!(e, BuildEvent::Skipped { .. }))
            .count();
        assert_eq!(skipped, 3);

        // edit one source: its object and the image rebuild
        fs::write(&project.sources[0].0, "alpha v2\n").unwrap();
        let (report, events) = run_build(&project, options);
        assert!(report.success());
        let a_object = project.out_dir.join("a.o");
        assert!(statuses_of(&events, &a_object).contains(&UnitStatus::Running));
        let skipped: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BuildEvent::Skipped { unit } => Some(unit.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec![project.out_dir.join("b.o")]);
        assert_eq!(fs::read(&a_object).unwrap(), b"alpha v2\n");
    }

    #[test]
    fn missing_toolchain_root_is_a_configuration_error() {
        let project = project(&[("a.c", "alpha\n")]);
        let graph = plan_graph(&project.sources, &project.out_dir, &project.image).unwrap();
        let config = BuildConfig::release("/definitely/not/here");
        let orchestrator = BuildOrchestrator::new(graph, config, BuildOptions::default());
        let (tx, _rx) = unbounded();
        assert!(matches!(
            orchestrator.run(&tx),
            Err(BuildError::Config(ConfigError::MissingToolchainRoot(_)))
        ));
    }
}
