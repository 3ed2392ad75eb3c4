//! run_script - execute one guest script through the pooled engines
//!
//! Useful for checking a code version before it is stored: the script runs
//! with the same wrapping, timeout and result rendering as live traffic.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use remote_config::{
    runtime::{pool::PoolConfig, EngineConfig},
    GuestLanguage, ScriptEngines,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Guest language (javascript|js|starlark).
    #[arg(long)]
    lang: String,
    /// Script file holding the body of the run function.
    #[arg(long)]
    file: PathBuf,
    /// JSON object passed as `p`.
    #[arg(long, default_value = "{}")]
    params: String,
    /// Execution timeout in milliseconds.
    #[arg(long, default_value_t = 100)]
    timeout_ms: u64,
    /// Install the syscall filter on the interpreter thread.
    #[arg(long)]
    confine: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let lang: GuestLanguage = args.lang.parse()?;
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read script {}", args.file.display()))?;
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("--params must be JSON")?;
    if !params.is_object() {
        return Err(anyhow!("--params must be a JSON object"));
    }

    let engines = ScriptEngines::new(&EngineConfig {
        pool: PoolConfig {
            size: 1,
            timeout: Duration::from_millis(args.timeout_ms),
            confine: args.confine,
        },
        ..EngineConfig::default()
    })?;

    let result = engines.run(lang, "", &source, &params.to_string())?;
    println!("{result}");
    Ok(())
}
