use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tessel::{read_module, run, RunOptions};
use tessel_core::{HostConfig, MAX_PAGES};
use tracing_subscriber::{fmt, EnvFilter};

/// tessel: load, validate and run WebAssembly modules.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input module (.wasm binary or .wat text)
    input: PathBuf,

    /// Exported function to call
    #[arg(long)]
    invoke: Option<String>,

    /// Arguments for the invoked function
    #[arg(allow_negative_numbers = true)]
    args: Vec<String>,

    /// Only parse and validate the module
    #[arg(long)]
    validate_only: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Deepest call chain before a stack overflow trap
    #[arg(long, default_value_t = 1024)]
    max_call_depth: usize,

    /// Operand stack slots before a stack overflow trap
    #[arg(long, default_value_t = 65536)]
    max_value_stack: usize,

    /// Largest linear memory, in 64 KiB pages
    #[arg(long, default_value_t = MAX_PAGES)]
    max_pages: u32,
}

impl Cli {
    fn options(&self) -> RunOptions {
        RunOptions {
            invoke: self.invoke.clone(),
            args: self.args.clone(),
            validate_only: self.validate_only,
            config: HostConfig::default()
                .with_max_call_depth(self.max_call_depth)
                .with_max_value_stack(self.max_value_stack)
                .with_max_memory_pages(self.max_pages),
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let bytes = read_module(&cli.input)?;
    let output = run(&bytes, &cli.options())?;
    print!("{output}");
    Ok(())
}
