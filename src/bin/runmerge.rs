use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use runmerge::{MergeSorter, Resources};

#[derive(Parser, Debug)]
#[command(name = "runmerge", version, about = "Sort u64 values with bounded memory")]
struct Args {
    /// Input file with one value per line. Reads stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Memory budget in MiB for every phase.
    #[arg(long)]
    memory: Option<usize>,
    /// Formation budget in MiB.
    #[arg(long)]
    m1: Option<usize>,
    /// Merge budget in MiB.
    #[arg(long)]
    m2: Option<usize>,
    /// Drain budget in MiB.
    #[arg(long)]
    m3: Option<usize>,

    /// Fix the run length instead of deriving it. Needs --fanout.
    #[arg(long = "run-length", requires = "fanout")]
    run_length: Option<usize>,
    #[arg(long, requires = "run_length")]
    fanout: Option<usize>,

    #[arg(long = "block-size", default_value_t = 64 * 1024)]
    block_size: usize,
    #[arg(long = "temp-dir")]
    temp_dir: Option<PathBuf>,

    /// Evacuate before draining and again halfway through.
    #[arg(long, default_value_t = false)]
    evacuate: bool,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

const MIB: usize = 1024 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "runmerge=debug" } else { "runmerge=info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let mut sorter = MergeSorter::natural(Resources::unlimited());
    if let Some(total) = args.memory {
        sorter.set_available_memory_total(total * MIB)?;
    }
    if args.m1.is_some() || args.m2.is_some() || args.m3.is_some() {
        let default = args.memory.map(|m| m * MIB);
        let pick = |m: Option<usize>| m.map(|m| m * MIB).or(default);
        if let (Some(m1), Some(m2), Some(m3)) = (pick(args.m1), pick(args.m2), pick(args.m3)) {
            sorter.set_available_memory(m1, m2, m3)?;
        } else {
            return Err("--m1, --m2 and --m3 must be given together unless --memory is set".into());
        }
    }
    if let (Some(run_length), Some(fanout)) = (args.run_length, args.fanout) {
        sorter.set_parameters(run_length, fanout)?;
    }
    sorter.set_block_size(args.block_size)?;
    if let Some(dir) = &args.temp_dir {
        sorter.set_temp_dir(dir)?;
    }

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    sorter.begin()?;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: u64 = trimmed
            .parse()
            .map_err(|e| format!("line {}: {:?}: {}", line_no + 1, trimmed, e))?;
        sorter.push(value)?;
    }
    sorter.end()?;

    let mut last_reported = 0;
    sorter.calc(&mut |done: u64, total: u64| {
        if total > 0 && done * 10 / total > last_reported {
            last_reported = done * 10 / total;
            info!("merged {} of {} items", done, total);
        }
    })?;

    let total = sorter.item_count();
    if args.evacuate {
        sorter.evacuate()?;
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut written = 0u64;
    while sorter.can_pull()? {
        writeln!(out, "{}", sorter.pull()?)?;
        written += 1;
        if args.evacuate && written == total / 2 {
            sorter.evacuate()?;
            info!(
                resident = sorter.resident_memory(),
                temp_bytes = sorter.temp_storage_usage(),
                "evacuated mid-drain"
            );
        }
    }
    out.flush()?;

    eprint!("{}", sorter.stats());
    Ok(())
}
