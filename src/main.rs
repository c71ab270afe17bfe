use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use memmap2::MmapOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use closepairs::{ConfigOverrides, CountConfig, Error, count_close_pairs};

/// Count pairs of points closer than 0.05 in a file of `x y z` lines.
#[derive(Debug, Parser)]
#[command(name = "closepairs", version)]
struct Args {
    /// Input file, one point per line.
    file: PathBuf,

    /// YAML config file. `CLOSEPAIRS_*` environment variables and flags
    /// override its settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// More logging on stderr; repeat for more. `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn run(args: &Args) -> closepairs::Result<u64> {
    let config = CountConfig::load(args.config.as_deref(), &args.overrides)?;
    info!(?config, file = %args.file.display(), "starting");

    let file = File::open(&args.file).map_err(io_error(&args.file))?;
    let len = file.metadata().map_err(io_error(&args.file))?.len();
    if len == 0 {
        return Ok(0);
    }
    // SAFETY: the file is only read, and is not expected to change while
    // mapped.
    let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(io_error(&args.file))?;
    count_close_pairs(&mmap, &config)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(pairs) => {
            let mut stdout = std::io::stdout().lock();
            if writeln!(stdout, "{pairs}").and_then(|_| stdout.flush()).is_err() {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("closepairs: {err}");
            ExitCode::FAILURE
        }
    }
}
