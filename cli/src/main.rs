use std::{
    io::{BufWriter, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, ValueEnum};
use miette::{Diagnostic, IntoDiagnostic, Result};
use tracing::debug;
use xslate::{CacheStrategy, Engine, EngineOptions, Error, Value, Vars, render_error};

/// xslate - Render templates from the command line
#[derive(Parser, Debug)]
#[command(name = "xslate")]
#[command(about = "Render xslate templates", long_about = None)]
struct Args {
    /// Template to render, resolved against the include paths
    template: Option<String>,

    /// Render this template source instead of a file
    #[arg(short = 'e', long = "eval", value_name = "SOURCE", conflicts_with = "template")]
    source: Option<String>,

    /// Directory to search for templates (repeatable; defaults to .)
    #[arg(short = 'I', long = "include", value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Directory for the compiled template cache
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// How compiled templates are reused
    #[arg(long, value_enum, default_value_t = CacheMode::Fresh)]
    cache: CacheMode,

    /// Set a variable; VALUE is parsed as JSON, or taken as a string
    #[arg(long = "var", value_name = "NAME=VALUE")]
    vars: Vec<String>,

    /// Read variables from a JSON object file
    #[arg(long = "vars", value_name = "FILE.json")]
    vars_file: Option<PathBuf>,

    /// Do not HTML-escape printed values
    #[arg(long)]
    no_escape: bool,

    /// Print the parsed syntax tree (for debugging)
    #[arg(long)]
    dump_ast: bool,

    /// Print the compiled bytecode (for debugging)
    #[arg(long)]
    dump_bytecode: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CacheMode {
    None,
    Memory,
    Fresh,
}

impl From<CacheMode> for CacheStrategy {
    fn from(mode: CacheMode) -> Self {
        match mode {
            CacheMode::None => CacheStrategy::None,
            CacheMode::Memory => CacheStrategy::MemoryOnly,
            CacheMode::Fresh => CacheStrategy::FreshnessChecked,
        }
    }
}

#[derive(Debug, thiserror::Error, Diagnostic)]
enum CliError {
    #[error("invalid --var '{0}'")]
    #[diagnostic(help("use NAME=VALUE, e.g. --var 'items=[1, 2]' or --var name=Ann"))]
    InvalidVar(String),

    #[error("{0} must contain a JSON object")]
    VarsNotObject(String),

    #[error("nothing to render")]
    #[diagnostic(help("pass a TEMPLATE name or -e SOURCE"))]
    NoTemplate,
}

/// Convert parsed JSON into a template value.
fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Undef,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(s),
        serde_json::Value::Array(items) => Value::list(items.into_iter().map(json_to_value)),
        serde_json::Value::Object(entries) => {
            Value::map(entries.into_iter().map(|(k, v)| (k, json_to_value(v))))
        }
    }
}

fn load_vars(args: &Args) -> Result<Vars> {
    let mut vars = Vars::new();

    if let Some(path) = &args.vars_file {
        let text = std::fs::read_to_string(path).into_diagnostic()?;
        let json: serde_json::Value = serde_json::from_str(&text).into_diagnostic()?;
        let serde_json::Value::Object(entries) = json else {
            return Err(CliError::VarsNotObject(path.display().to_string()).into());
        };
        for (name, value) in entries {
            vars.insert(name.into(), json_to_value(value));
        }
    }

    for binding in &args.vars {
        let Some((name, raw)) = binding.split_once('=') else {
            return Err(CliError::InvalidVar(binding.clone()).into());
        };
        if name.is_empty() {
            return Err(CliError::InvalidVar(binding.clone()).into());
        }
        let value = serde_json::from_str(raw)
            .map(json_to_value)
            .unwrap_or_else(|_| Value::str(raw));
        vars.insert(name.into(), value);
    }

    Ok(vars)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging subscriber
    use tracing_subscriber::{EnvFilter, fmt};

    // Use RUST_LOG environment variable to control log level
    // Default to WARN, or INFO when dumping so the dumps are shown
    let default_level = if args.dump_ast || args.dump_bytecode {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .into_diagnostic()?;

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let vars = load_vars(&args)?;

    let load_paths = if args.include.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        args.include.clone()
    };
    let mut options = EngineOptions {
        load_paths,
        cache_dir: args.cache_dir.clone(),
        ..EngineOptions::default()
    };
    options.loader.strategy = args.cache.into();
    options.loader.dump_ast = args.dump_ast;
    options.loader.dump_bytecode = args.dump_bytecode;
    options.compilation.auto_escape = !args.no_escape;

    debug!(
        load_paths = ?options.load_paths,
        strategy = ?options.loader.strategy,
        vars = vars.len(),
        "rendering"
    );
    let engine = Engine::new(options).into_diagnostic()?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let result = match (&args.source, &args.template) {
        (Some(source), _) => engine
            .render_string(source, &vars)
            .and_then(|text| {
                out.write_all(text.as_bytes())
                    .map_err(|e| Error::Runtime(e.into()))
            }),
        (None, Some(name)) => engine.render_to(name, &vars, &mut out).map(|_| ()),
        (None, None) => return Err(CliError::NoTemplate.into()),
    };
    // Keep whatever was rendered before a failure.
    out.flush().into_diagnostic()?;

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            render_error(&e);
            Ok(ExitCode::FAILURE)
        }
    }
}
