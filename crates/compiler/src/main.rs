//! Molt Compiler CLI
//!
//! Thin driver over the mid-end: optimize `.tir` module artifacts, verify
//! them, validate intrinsics manifests, and emit reference output. The
//! packaging toolchain and source frontend are separate programs; this
//! binary only exercises the compiler spine.

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use moltc::{artifact, compile_module, CompilerConfig, EmitFormat, OptLevel, TextBackend, TypeFacts};
use molt_core::{CapabilitySet, IntrinsicsManifest};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "moltc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Molt compiler mid-end - optimize and emit .tir modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmitArg {
    Text,
    Json,
    Bin,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize a module artifact and emit the result
    Opt {
        /// Input module (.tir.json or .tir binary)
        input: PathBuf,

        /// Output path (defaults to stdout for text/json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        emit: EmitArg,

        /// Type facts artifact to drive speculation
        #[arg(long)]
        tfa: Option<PathBuf>,

        /// Capabilities granted to bridge calls (comma-separated)
        #[arg(long, default_value = "")]
        caps: String,

        /// Skip the optimization fixed point (verify + lower only)
        #[arg(long)]
        no_opt: bool,
    },

    /// Verify a module artifact without transforming it
    Check {
        /// Input module (.tir.json or .tir binary)
        input: PathBuf,
    },

    /// Validate an intrinsics manifest (or the embedded canonical one)
    Manifest {
        /// Manifest file; omitted checks the embedded manifest
        path: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Opt {
            input,
            output,
            emit,
            tfa,
            caps,
            no_opt,
        } => run_opt(&input, output.as_deref(), emit, tfa.as_deref(), &caps, no_opt),
        Commands::Check { input } => run_check(&input),
        Commands::Manifest { path } => run_manifest(path.as_deref()),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "moltc", &mut io::stdout());
        }
    }
}

fn load_module(path: &Path) -> moltc::tir::Module {
    let result = if path.extension().is_some_and(|e| e == "json") {
        std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| artifact::read_module_json(&text))
    } else {
        std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| artifact::read_module_bin(&bytes))
    };
    match result {
        Ok(module) => module,
        Err(e) => {
            eprintln!("error: failed to load '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

fn run_opt(
    input: &Path,
    output: Option<&Path>,
    emit: EmitArg,
    tfa_path: Option<&Path>,
    caps: &str,
    no_opt: bool,
) {
    let mut module = load_module(input);

    let tfa = match tfa_path {
        Some(path) => match TypeFacts::load(path) {
            Ok(tfa) => tfa,
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        },
        None => TypeFacts::empty(),
    };

    let capabilities = match CapabilitySet::parse(caps) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    let config = CompilerConfig::default()
        .with_capabilities(capabilities)
        .with_opt_level(if no_opt { OptLevel::O0 } else { OptLevel::O1 })
        .with_emit(match emit {
            EmitArg::Text => EmitFormat::Text,
            EmitArg::Json => EmitFormat::Json,
            EmitArg::Bin => EmitFormat::Bin,
        });

    let stats = match compile_module(&mut module, &tfa, &config) {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };
    tracing::info!(?stats, "pipeline finished");

    let bytes = match config.emit {
        EmitFormat::Text => match moltc::emit(&module, &mut TextBackend::new()) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        },
        EmitFormat::Json => match artifact::write_module_json(&module) {
            Ok(s) => s.into_bytes(),
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        },
        EmitFormat::Bin => match artifact::write_module_bin(&module) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("error: {}", e);
                process::exit(1);
            }
        },
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &bytes) {
                eprintln!("error: failed to write '{}': {}", path.display(), e);
                process::exit(1);
            }
        }
        None => {
            use io::Write;
            if io::stdout().write_all(&bytes).is_err() {
                process::exit(1);
            }
        }
    }
}

fn run_check(input: &Path) {
    let module = load_module(input);
    let mut failed = false;
    for func in &module.functions {
        if let Err(e) = moltc::tir::verify::verify(func) {
            eprintln!("{}: {}", func.name, e);
            failed = true;
        }
    }
    if let Err(e) = moltc::lower::check_calls(&module, &CompilerConfig::default()) {
        // Capability mismatches are expected without grants; only report
        // structural problems here.
        if !matches!(e, moltc::CompileError::CapabilityMismatch { .. }) {
            eprintln!("{}", e);
            failed = true;
        }
    }
    if failed {
        process::exit(1);
    }
    println!(
        "ok: {} function(s), {} global(s), {} class(es)",
        module.functions.len(),
        module.globals.len(),
        module.classes.len()
    );
}

fn run_manifest(path: Option<&Path>) {
    let manifest = match path {
        Some(path) => {
            let content = match std::fs::read_to_string(path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: failed to read '{}': {}", path.display(), e);
                    process::exit(1);
                }
            };
            match IntrinsicsManifest::parse(&content) {
                Ok(m) => m,
                Err(e) => {
                    eprintln!("error: {}", e);
                    process::exit(1);
                }
            }
        }
        None => IntrinsicsManifest::canonical().clone(),
    };
    println!(
        "ok: manifest v{} with {} intrinsic(s)",
        manifest.version,
        manifest.len()
    );
}
