// (c) Roel Kluin, 2023, GPL v3

use crate::db::Database;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::new_types::key::Key;
use crate::new_types::value::Value;
use crate::node::Node;
use ahash::AHashMap;
use anyhow::{anyhow, ensure};
use bincode::{deserialize_from, serialize_into};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Work on one node: fill it from `args`. The caller commits.
pub type Handler = fn(&mut Node, &[Value]) -> anyhow::Result<()>;

/// Handlers by stable name. Task files carry the name only; a worker
/// resolves it against the registry it was built with.
#[derive(Default, Clone)]
pub struct Registry {
    handlers: AHashMap<String, Handler>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Registry").field(&self.names()).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }
    /// `constant` and `position`.
    pub fn with_builtins() -> Self {
        let mut r = Registry::new();
        r.register("constant", fill_constant);
        r.register("position", fill_position);
        r
    }
    /// Replaces any handler of the same name.
    pub fn register(&mut self, name: &str, handler: Handler) -> &mut Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }
    pub fn resolve(&self, name: &str) -> Result<Handler> {
        self.handlers
            .get(name)
            .copied()
            .ok_or_else(|| Error::TaskResolution {
                name: name.to_string(),
                source: "no such handler registered".into(),
            })
    }
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// Same encoding as `Task`; avoids cloning the node to write it.
#[derive(Serialize)]
struct TaskRef<'a> {
    handler: &'a str,
    node: &'a Node,
    args: &'a [Value],
}

/// The content of a task file.
#[derive(new, Debug, Serialize, Deserialize)]
pub struct Task {
    pub handler: String,
    pub node: Node,
    pub args: Vec<Value>,
}

/// Writes a uniquely named task file into `scratch_dir` and returns its path.
pub fn serialize_task(scratch_dir: &Path, handler: &str, node: &Node, args: &[Value]) -> Result<PathBuf> {
    fs::create_dir_all(scratch_dir)?;
    let mut file = tempfile::Builder::new().prefix("task").tempfile_in(scratch_dir)?;
    {
        let mut w = BufWriter::new(file.as_file_mut());
        serialize_into(&mut w, &TaskRef { handler, node, args })?;
        w.flush()?;
    }
    let (_, path) = file.keep().map_err(|e| e.error)?;
    debug!("Task {:?}: {} on {}", path, handler, node.start_key());
    Ok(path)
}

pub fn read_task(path: &Path) -> Result<Task> {
    let malformed = |source| Error::MalformedTask {
        path: path.to_path_buf(),
        source,
    };
    let file = BufReader::new(File::open(path)?);
    let task: Task = deserialize_from(file).map_err(malformed)?;
    task.node
        .check_slots()
        .map_err(|reason| malformed(Box::new(bincode::ErrorKind::Custom(reason))))?;
    Ok(task)
}

/// Runs a task file: resolve, invoke, commit, delete. On any failure the
/// task file stays so that it can be resubmitted.
pub fn execute_task(registry: &Registry, path: &Path) -> Result<()> {
    let Task {
        handler: name,
        mut node,
        args,
    } = read_task(path)?;
    let handler = registry.resolve(&name)?;
    handler(&mut node, &args).map_err(|e| Error::TaskResolution {
        name: name.clone(),
        source: e.into(),
    })?;
    node.commit()?;
    fs::remove_file(path)?;
    info!("Task {} done for {}", name, node.start_key());
    Ok(())
}

/// Fans one handler out over shards: a task file and a worker process per
/// shard. The worker is invoked as `<worker> run-task <task file>`.
#[derive(new, Debug, Clone)]
pub struct MapJob {
    handler: String,
    args: Vec<Value>,
    worker: PathBuf,
    scratch_dir: PathBuf,
}

impl MapJob {
    /// Submits one task per key and waits for all of them. Returns the
    /// number of tasks submitted.
    pub fn run<E, I>(&self, db: &Database, executor: &mut E, keys: I) -> Result<usize>
    where
        E: Executor + ?Sized,
        I: IntoIterator<Item = Key>,
    {
        let mut n = 0;
        for key in keys {
            let node = db.get_write_node(key)?;
            let task = serialize_task(&self.scratch_dir, &self.handler, &node, &self.args)?;
            executor.submit(
                self.worker.as_os_str(),
                &[OsString::from("run-task"), task.into_os_string()],
            )?;
            n += 1;
        }
        info!("Submitted {} {} tasks, waiting", n, self.handler);
        executor.wait(true)?;
        Ok(n)
    }
}

// Positions of a node that lie on its chromosome.
fn covered(node: &Node) -> anyhow::Result<std::ops::Range<u64>> {
    let start = node.start_key().get_last_key();
    let max = node.database().schema().max_position(node.start_key())?;
    Ok(start..node.end_pos().min(max + 1).max(start))
}

fn fill_constant(node: &mut Node, args: &[Value]) -> anyhow::Result<()> {
    ensure!(args.len() == 1, "constant takes one argument, got {}", args.len());
    for pos in covered(node)? {
        node.assign(pos, args[0].clone())?;
    }
    Ok(())
}

fn fill_position(node: &mut Node, args: &[Value]) -> anyhow::Result<()> {
    ensure!(args.is_empty(), "position takes no arguments");
    for pos in covered(node)? {
        let v = i64::try_from(pos).map_err(|_| anyhow!("position {} too large", pos))?;
        node.assign(pos, v)?;
    }
    Ok(())
}
