use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ruvm_core::iseq::{Iseq, IseqDef};
use ruvm_core::val::Val;
use ruvm_core::vm::{ExecContext, Vm};

static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "ruvm_core=info,ruvm_cli=info";

#[derive(Debug, Parser)]
#[command(
    name = "ruvm",
    author,
    version,
    about = "Runner for ruvm bytecode modules",
    long_about = None
)]
struct CliArgs {
    /// Subcommands like `check FILE`
    #[command(subcommand)]
    command: Option<Commands>,

    /// If no subcommand, treat as a bytecode module to execute
    #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
    file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a bytecode module and print its result.
    Run {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
    },
    /// Load and validate a module without executing it.
    Check {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
    },
    /// Print the instruction listing of a module.
    Disasm {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,
    },
}

fn sanitize_path(raw: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(raw);
    for comp in p.components() {
        if matches!(comp, Component::ParentDir) {
            anyhow::bail!("Parent directory components ('..') are not allowed in file paths.");
        }
    }
    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    !(trimmed.eq_ignore_ascii_case("0")
        || trimmed.eq_ignore_ascii_case("false")
        || trimmed.eq_ignore_ascii_case("off"))
}

fn maybe_init_tracing() {
    let raw = match std::env::var("RUVM_TRACE") {
        Ok(value) => value,
        Err(_) => return,
    };
    if !env_toggle_enabled(&raw) {
        return;
    }

    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter = std::env::var("RUST_LOG")
            .ok()
            .and_then(|expr| EnvFilter::try_new(expr).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_TRACE_FILTER));
        let _ = fmt().with_writer(std::io::stderr).with_env_filter(filter).try_init();
    });
}

fn load_module(path: &Path) -> anyhow::Result<Arc<Iseq>> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file '{}'", path.display()))?;
    let def: IseqDef = serde_json::from_str(&src)
        .with_context(|| format!("'{}' is not a valid bytecode module", path.display()))?;
    Iseq::from_def(&def)
}

fn run_module(path: &Path) -> anyhow::Result<()> {
    let iseq = load_module(path)?;
    let vm = Vm::new();
    let mut ctx = ExecContext::new(&vm);
    let result = ctx.eval(&iseq)?;
    if !matches!(result, Val::Nil) {
        println!("{result}");
    }
    Ok(())
}

fn check_module(path: &Path) -> anyhow::Result<()> {
    let iseq = load_module(path)?;
    println!("{}: ok ({} instructions)", iseq.name, iseq.code.len());
    Ok(())
}

fn disasm_module(path: &Path) -> anyhow::Result<()> {
    let iseq = load_module(path)?;
    print!("{}", disasm(&iseq));
    Ok(())
}

/// Render an iseq tree as a flat listing, nested sequences after their
/// parent.
fn disasm(iseq: &Iseq) -> String {
    let mut out = String::new();
    disasm_one(iseq, &mut out);
    out
}

fn disasm_one(iseq: &Iseq, out: &mut String) {
    use std::fmt::Write as _;

    let locals: Vec<&str> = iseq.locals.iter().map(|s| &**s).collect();
    let _ = writeln!(out, "== {} ({:?}) locals={:?}", iseq.name, iseq.kind, locals);
    for (pc, insn) in iseq.code.iter().enumerate() {
        let _ = writeln!(out, "{pc:04} {insn:?}");
    }
    for entry in &iseq.catch_table {
        let handler = entry.iseq.as_ref().map(|h| &*h.name).unwrap_or("-");
        let _ = writeln!(
            out,
            "catch {:?} [{}, {}) cont={} sp={} handler={}",
            entry.kind, entry.start, entry.end, entry.cont, entry.sp, handler
        );
    }
    let mut nested: Vec<&Arc<Iseq>> = Vec::new();
    for c in &iseq.consts {
        if let Val::Iseq(child) = c {
            nested.push(child);
        }
    }
    for entry in &iseq.catch_table {
        if let Some(h) = &entry.iseq {
            nested.push(h);
        }
    }
    for child in nested {
        out.push('\n');
        disasm_one(child, out);
    }
}

fn main() {
    maybe_init_tracing();
    let args = CliArgs::parse();

    let result = match (args.command, args.file) {
        (Some(Commands::Run { file }), _) => run_module(&file),
        (Some(Commands::Check { file }), _) => check_module(&file),
        (Some(Commands::Disasm { file }), _) => disasm_module(&file),
        (None, Some(file)) => run_module(&file),
        (None, None) => {
            eprintln!("Error: no input file; see `ruvm --help`");
            std::process::exit(2);
        }
    };
    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
