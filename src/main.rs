//! gscript CLI and REPL
//!
//! Usage:
//!   gscript test <file.gs>      - Check a script for syntax errors
//!   gscript shell               - Start interactive REPL
//!   gscript compile <file.gs>   - Package a script into a standalone program
//!   gscript run <file.gs>       - Execute a script and its deploy hooks

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{error, info};

use gscript::aot::{self, CompilerJob, RuntimeDependency};
use gscript::config::Manifest;
use gscript::logging::{self, Verbosity};
use gscript::{validate, BuiltinLibrary, ExecutionPlan, HostValue, Runtime, VERSION};

#[derive(Debug, Parser)]
#[command(name = "gscript", version, about = "A capability-bounded scripting engine")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check a script for syntax errors without running it
    #[command(alias = "t")]
    Test {
        file: PathBuf,

        /// External linter run on the file first
        #[arg(long)]
        linter: Option<String>,
    },

    /// Start an interactive shell
    #[command(alias = "s")]
    Shell,

    /// Package a script and its resources into a Cargo project
    #[command(alias = "c")]
    Compile {
        file: PathBuf,

        /// Artifact name (defaults to the script's file stem)
        #[arg(long)]
        name: Option<String>,

        /// Output directory; must not exist yet
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Resource file to embed; repeatable
        #[arg(long = "asset")]
        assets: Vec<PathBuf>,

        /// TOML manifest with packaging options
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Depend on a local gscript checkout instead of the registry
        #[arg(long)]
        runtime_path: Option<PathBuf>,

        /// Run `cargo build --release` in the generated project
        #[arg(long)]
        build: bool,
    },

    /// Execute a script and its deploy hooks
    #[command(alias = "r")]
    Run { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.debug, cli.quiet));

    let result = match cli.command {
        Commands::Test { file, linter } => test_file(&file, linter.as_deref()),
        Commands::Shell => run_repl(),
        Commands::Compile {
            file,
            name,
            output,
            assets,
            manifest,
            runtime_path,
            build,
        } => compile_job(&file, name, output, assets, manifest.as_deref(), runtime_path)
            .and_then(|job| compile(&job, build)),
        Commands::Run { file } => run_file(&file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn read_script(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("cannot read script {}", path.display()))
}

fn test_file(path: &Path, linter: Option<&str>) -> Result<()> {
    let source = read_script(path)?;

    if let Some(linter) = linter {
        info!(linter, "running linter");
        let status = Command::new(linter)
            .arg(path)
            .status()
            .with_context(|| format!("cannot start linter {}", linter))?;
        if !status.success() {
            bail!("linter {} reported problems ({})", linter, status);
        }
    }

    let script = validate(&source).with_context(|| format!("{} is invalid", path.display()))?;
    info!(
        file = %path.display(),
        declarations = script.declarations().len(),
        "script is valid"
    );
    Ok(())
}

/// Build the job from the script, an optional manifest and the command-line flags
fn compile_job(
    file: &Path,
    name: Option<String>,
    output: Option<PathBuf>,
    assets: Vec<PathBuf>,
    manifest: Option<&Path>,
    runtime_path: Option<PathBuf>,
) -> Result<CompilerJob> {
    let mut job = CompilerJob::new(file);
    if let Some(manifest) = manifest {
        let base_dir = manifest.parent().map(Path::to_path_buf).unwrap_or_default();
        job = Manifest::load(manifest)?.apply(job, &base_dir);
    }

    // Flags override the manifest
    if let Some(name) = name {
        job = job.with_name(name);
    }
    if let Some(output) = output {
        job = job.with_output_dir(output);
    }
    job.resources.extend(assets);
    if let Some(path) = runtime_path {
        job = job.with_runtime(RuntimeDependency::Path(path));
    }
    Ok(job)
}

fn compile(job: &CompilerJob, build: bool) -> Result<()> {
    let tree = aot::compile(job)?;
    println!("{} {}", "generated".green().bold(), tree.root.display());

    if build {
        aot::invoke_toolchain(&tree, "cargo", &["build", "--release"])?;
        println!("{} {}", "built".green().bold(), tree.root.join("target").join("release").join(&tree.name).display());
    }
    Ok(())
}

fn run_file(path: &Path) -> Result<()> {
    let source = read_script(path)?;

    let mut runtime = Runtime::new();
    runtime.register_builtins(&BuiltinLibrary::standard())?;
    runtime.load(&source)?;
    runtime.run()?;

    let report = ExecutionPlan::discover(&runtime)?.execute(&mut runtime)?;
    info!(completed = ?report.completed, "{} finished", path.display());
    Ok(())
}

fn new_runtime() -> Result<Runtime> {
    let mut runtime = Runtime::new();
    runtime.register_builtins(&BuiltinLibrary::standard())?;
    Ok(runtime)
}

fn run_repl() -> Result<()> {
    println!("{} {} - {}",
        "gscript".cyan().bold(),
        VERSION.cyan(),
        "capability-bounded scripting".dimmed()
    );
    println!("Type {} to exit, {} for help\n",
        "exit".yellow(),
        "help".yellow()
    );

    let mut rl = DefaultEditor::new().context("cannot start line editor")?;

    // One runtime for the whole session so globals persist between lines
    let mut runtime = new_runtime()?;

    loop {
        match rl.readline(&format!("{} ", "gs>".green().bold())) {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    "exit" | "quit" => {
                        println!("{}", "Goodbye!".cyan());
                        break;
                    }
                    "help" => {
                        print_repl_help();
                        continue;
                    }
                    "builtins" => {
                        for builtin in BuiltinLibrary::standard().iter() {
                            println!("  {}", builtin.signature());
                        }
                        continue;
                    }
                    "clear" => {
                        runtime = new_runtime()?;
                        println!("{}", "State cleared.".dimmed());
                        continue;
                    }
                    _ => {}
                }

                match runtime.eval(line) {
                    Ok(HostValue::Nil) => {}
                    Ok(value) => {
                        println!("{} {}", "=>".dimmed(), value.to_string().cyan());
                    }
                    Err(err) => {
                        eprintln!("{}", err.to_string().red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => {
                println!("{}", "Goodbye!".cyan());
                break;
            }
            Err(err) => {
                eprintln!("{}: {:?}", "error".red(), err);
                break;
            }
        }
    }
    Ok(())
}

fn print_repl_help() {
    println!("{}", "Shell Commands:".yellow());
    println!("  exit, quit   Exit the shell");
    println!("  clear        Start over with a fresh runtime");
    println!("  builtins     List the available builtins");
    println!("  help         Show this help\n");
    println!("{}", "Language Examples:".yellow());
    println!("  let name = \"agent\"");
    println!("  var count = 0");
    println!("  count = count + 1");
    println!("  MD5(\"helloworld\")");
    println!("  fn Deploy() {{ return Exec(\"uname\", [\"-a\"]).success }}");
}
