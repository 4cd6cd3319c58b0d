// (c) Roel Kluin, 2023, GPL v3

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use genomedb::new_types::key::Key;
use genomedb::{Config, Database, Genome, MapJob, Registry, Schema, ValueType};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Which database to operate on.
#[derive(Args, Debug)]
struct DbArgs {
    /// Base directory of the shards
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Built-in genome by short name
    #[arg(short, long, default_value = "Ag")]
    genome: String,

    /// Take chromosome sizes from this FASTA instead of a built-in genome
    #[arg(short = 'R', long, value_name = "FASTA")]
    reference: Option<PathBuf>,

    /// Positions per shard
    #[arg(short = 'G', long, default_value = "10000")]
    granularity: u64,

    /// Int, Float, Text or Flag
    #[arg(short = 't', long, default_value = "text")]
    value_type: ValueType,

    /// Store only assigned positions
    #[arg(short, long)]
    sparse: bool,

    /// Leave these chromosomes out
    #[arg(short = 'x', long, value_name = "CHROM")]
    exclude: Vec<String>,
}

impl DbArgs {
    fn database(&self) -> Result<Database> {
        let genome = match &self.reference {
            Some(fasta) => Genome::from_fasta(fasta, &self.genome, &self.genome, 0, "")
                .with_context(|| format!("reading {}", fasta.display()))?,
            None => Genome::builtin(&self.genome)
                .ok_or_else(|| anyhow!("no built-in genome {:?}", self.genome))?,
        };
        let exclude: Vec<&str> = self.exclude.iter().map(String::as_str).collect();
        let genome = genome.without_chroms(&exclude);
        let schema = Schema::genome(self.granularity, self.value_type, genome)?;
        // workers may run elsewhere in the tree
        fs::create_dir_all(&self.dir)?;
        let dir = fs::canonicalize(&self.dir)?;
        Ok(Database::new(dir, schema, self.sparse))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one task file
    RunTask {
        #[arg(value_name = "FILE")]
        task: PathBuf,
    },

    /// List the shards that are not on disk
    Missing(DbArgs),

    /// Print all stored values, tab separated
    Dump {
        #[command(flatten)]
        db: DbArgs,

        /// Also print positions without a value
        #[arg(short, long)]
        all: bool,
    },

    /// Fill the database by running a handler on every shard
    Map {
        #[command(flatten)]
        db: DbArgs,

        /// Name of a registered handler
        #[arg(long, value_name = "NAME")]
        handler: String,

        /// Handler argument, parsed as the value type
        #[arg(short, long = "arg", value_name = "V")]
        args: Vec<String>,

        /// Only the shards that are missing
        #[arg(short, long)]
        missing_only: bool,
    },
}

/// Sharded per-position genome results
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct GenomeDb {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_keys(keys: &[Key]) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    for key in keys {
        writeln!(out, "{}", key)?;
    }
    out.flush()?;
    Ok(())
}

fn dump(db: &Database, all: bool) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    for res in db.get_values() {
        let (key, value) = match res {
            Ok(kv) => kv,
            Err(e) if e.is_missing_data() => {
                return Err(anyhow!(e).context("database incomplete, see `genomedb missing`"))
            }
            Err(e) => return Err(e.into()),
        };
        if value.is_none() && !all {
            continue;
        }
        let fields = key.fields().join("\t");
        match value {
            Some(v) => writeln!(out, "{}\t{}\t{}", fields, key.get_last_key(), v.to_line())?,
            None => writeln!(out, "{}\t{}\t", fields, key.get_last_key())?,
        }
    }
    out.flush()?;
    Ok(())
}

fn map(config: &Config, db: &Database, handler: &str, args: &[String], missing_only: bool) -> Result<()> {
    let registry = Registry::with_builtins();
    registry.resolve(handler)?;
    let value_type = db.schema().value_type();
    let args = args
        .iter()
        .map(|a| value_type.parse_arg(a).map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;
    let keys: Vec<Key> = if missing_only {
        db.find_missing_nodes()?
    } else {
        db.schema().enumerate_node_keys().collect()
    };
    let worker = std::env::current_exe().context("locating the worker binary")?;
    let mut executor = config.executor();
    info!(
        "Map {} over {} shards, {} at a time",
        handler,
        keys.len(),
        executor.slots()
    );
    let job = MapJob::new(handler.to_string(), args, worker, config.mr_dir.clone());
    job.run(db, &mut executor, keys)?;

    let missing = db.find_missing_nodes()?;
    if executor.failures() > 0 || !missing.is_empty() {
        print_keys(&missing)?;
        bail!(
            "{} tasks failed, {} shards missing; task files are left in {}",
            executor.failures(),
            missing.len(),
            config.mr_dir.display()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = GenomeDb::parse();
    init_logging(cli.debug);
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::RunTask { task }) => {
            genomedb::execute_task(&Registry::with_builtins(), &task)
                .with_context(|| format!("task {}", task.display()))?;
        }
        Some(Commands::Missing(db)) => {
            let db = db.database()?;
            for tmp in db.stray_tmp_files()? {
                warn!("Stray {:?}: its writer died before the rename", tmp);
            }
            print_keys(&db.find_missing_nodes()?)?
        }
        Some(Commands::Dump { db, all }) => dump(&db.database()?, all)?,
        Some(Commands::Map {
            db,
            handler,
            args,
            missing_only,
        }) => map(&config, &db.database()?, &handler, &args, missing_only)?,
        None => {}
    }
    Ok(())
}
