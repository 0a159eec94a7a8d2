use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{Receiver, unbounded};

use mdrom::builder::{
    BuildEvent, BuildOptions, BuildOrchestrator, BuildReport, FailMode, RebuildPolicy, object_path,
    plan_graph,
};
use mdrom::config::BuildConfig;
use mdrom::graph::{UnitKind, UnitStatus};
use mdrom::rom_header::{self, RomHeader};

const EXIT_OK: i32 = 0;
const EXIT_BUILD_FAILED: i32 = 1;
const EXIT_LINK_FAILED: i32 = 2;
const EXIT_CONFIG: i32 = 3;

#[derive(Parser)]
#[command(name = "mdrom")]
#[command(version, about = "Mega Drive ROM build tool", long_about = None)]
struct Cli {
    /// Verbose diagnostic logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the ROM from the project in the current directory
    Build {
        /// Build with the Debug preset instead of Release
        #[arg(long)]
        debug: bool,

        /// SGDK toolchain root (defaults to $SGDK)
        #[arg(long)]
        sdk: Option<PathBuf>,

        /// Maximum concurrent toolchain processes
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Stop dispatching new units after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Kill in-flight processes when failing fast
        #[arg(long, requires = "fail_fast")]
        kill: bool,

        /// When an existing output may be reused
        #[arg(long, value_enum, default_value = "always")]
        rebuild: RebuildArg,

        /// Per-invocation timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Output ROM path (defaults to out/rom.bin)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Emit the 256-byte ROM header on its own
    Header {
        /// Output path
        #[arg(short, long, default_value = "out/rom_header.bin")]
        output: PathBuf,

        /// Local and international title
        #[arg(long)]
        title: Option<String>,

        /// Serial, e.g. "GM 00000000-00"
        #[arg(long)]
        serial: Option<String>,

        /// Region string, e.g. "JUE"
        #[arg(long)]
        region: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RebuildArg {
    Always,
    Mtime,
    Crc32,
}

impl From<RebuildArg> for RebuildPolicy {
    fn from(arg: RebuildArg) -> Self {
        match arg {
            RebuildArg::Always => RebuildPolicy::Always,
            RebuildArg::Mtime => RebuildPolicy::Mtime,
            RebuildArg::Crc32 => RebuildPolicy::Crc32,
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .compact()
        .init();
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Build {
            debug,
            sdk,
            jobs,
            fail_fast,
            kill,
            rebuild,
            timeout,
            output,
        } => do_build(BuildArgs {
            debug,
            sdk,
            jobs,
            fail_fast,
            kill,
            rebuild,
            timeout,
            output,
        }),
        Commands::Header {
            output,
            title,
            serial,
            region,
        } => do_header(output, title, serial, region),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(EXIT_BUILD_FAILED);
        }
    }
}

struct BuildArgs {
    debug: bool,
    sdk: Option<PathBuf>,
    jobs: Option<usize>,
    fail_fast: bool,
    kill: bool,
    rebuild: RebuildArg,
    timeout: Option<u64>,
    output: Option<PathBuf>,
}

fn do_build(args: BuildArgs) -> Result<i32> {
    let project_dir = std::env::current_dir().context("failed to get current directory")?;

    let Some(toolchain_root) = args
        .sdk
        .or_else(|| std::env::var_os("SGDK").map(PathBuf::from))
    else {
        eprintln!("No toolchain root: pass --sdk or set SGDK");
        return Ok(EXIT_CONFIG);
    };

    let sources = discover_sources(&project_dir.join("src"))?;
    if sources.is_empty() {
        eprintln!("No source files found under src/");
        return Ok(EXIT_CONFIG);
    }

    let out_dir = project_dir.join("out");
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let body_path = out_dir.join("rom_body.bin");

    let config = if args.debug {
        BuildConfig::debug(&toolchain_root)
    } else {
        BuildConfig::release(&toolchain_root)
    };
    let options = BuildOptions {
        jobs: args.jobs.unwrap_or_else(default_jobs),
        fail_mode: if args.fail_fast {
            FailMode::FailFast {
                kill_in_flight: args.kill,
            }
        } else {
            FailMode::BestEffort
        },
        rebuild: args.rebuild.into(),
        timeout: args.timeout.map(Duration::from_secs),
    };

    let graph = match plan_graph(&sources, &out_dir, &body_path) {
        Ok(graph) => graph,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(EXIT_CONFIG);
        }
    };

    println!("Building {} units ({})...", graph.len(), config.name);

    // progress verbs, chosen by what produces each object
    let mut verbs: HashMap<PathBuf, &'static str> = HashMap::new();
    for (source, kind) in &sources {
        let verb = match kind {
            UnitKind::AsmSource => "Assembling",
            _ => "Compiling",
        };
        verbs.insert(object_path(&out_dir, source), verb);
    }

    let orchestrator = BuildOrchestrator::new(graph, config, options);
    let (events_tx, events_rx) = unbounded();
    let printer = thread::spawn(move || print_events(events_rx, verbs));
    let result = orchestrator.run(&events_tx);
    drop(events_tx);
    let _ = printer.join();

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(EXIT_CONFIG);
        }
    };

    if report.success() {
        let body = fs::read(&body_path)
            .with_context(|| format!("failed to read linked image {}", body_path.display()))?;
        let rom = rom_header::assemble(&RomHeader::default(), &body);
        let rom_path = args.output.unwrap_or_else(|| out_dir.join("rom.bin"));
        fs::write(&rom_path, &rom)
            .with_context(|| format!("failed to write {}", rom_path.display()))?;
        println!("Build complete: {} ({} bytes)", rom_path.display(), rom.len());
        Ok(EXIT_OK)
    } else {
        print_report(&report);
        let code = if report
            .failed
            .iter()
            .any(|f| f.kind == UnitKind::LinkedImage)
        {
            EXIT_LINK_FAILED
        } else {
            EXIT_BUILD_FAILED
        };
        Ok(code)
    }
}

fn default_jobs() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Find the project's source units: .c and .s files under src/.
fn discover_sources(src_dir: &Path) -> Result<Vec<(PathBuf, UnitKind)>> {
    let mut sources = Vec::new();
    if !src_dir.is_dir() {
        return Ok(sources);
    }
    for entry in fs::read_dir(src_dir)
        .with_context(|| format!("failed to read {}", src_dir.display()))?
    {
        let path = entry?.path();
        let kind = match path.extension().and_then(|e| e.to_str()) {
            Some("c") => UnitKind::CSource,
            Some("s") | Some("S") => UnitKind::AsmSource,
            _ => continue,
        };
        sources.push((path, kind));
    }
    sources.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(sources)
}

fn print_events(events: Receiver<BuildEvent>, verbs: HashMap<PathBuf, &'static str>) {
    for event in events {
        match event {
            BuildEvent::StatusChanged {
                unit,
                kind,
                status: UnitStatus::Running,
            } => match kind {
                UnitKind::Object => {
                    let verb = verbs.get(&unit).copied().unwrap_or("Building");
                    println!("  {} {}...", verb, unit.display());
                }
                UnitKind::LinkedImage => println!("  Linking {}...", unit.display()),
                _ => {}
            },
            BuildEvent::Skipped { unit } => println!("  {} is up to date", unit.display()),
            _ => {}
        }
    }
}

fn print_report(report: &BuildReport) {
    for failure in &report.failed {
        eprintln!("{} failed:", failure.unit.display());
        for line in failure.diagnostics.lines() {
            eprintln!("  {line}");
        }
    }
    for blocked in &report.blocked {
        eprintln!("{}: blocked by a failed dependency", blocked.display());
    }
}

fn do_header(
    output: PathBuf,
    title: Option<String>,
    serial: Option<String>,
    region: Option<String>,
) -> Result<i32> {
    let mut header = RomHeader::default();
    if let Some(title) = title {
        header.title_local = title.clone();
        header.title_int = title;
    }
    if let Some(serial) = serial {
        header.serial = serial;
    }
    if let Some(region) = region {
        header.region = region;
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    fs::write(&output, header.emit())
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Created: {}", output.display());
    Ok(EXIT_OK)
}
