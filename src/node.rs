// (c) Roel Kluin, 2023, GPL v3

use crate::db::Database;
use crate::error::{Error, Result};
use crate::new_types::key::Key;
use crate::new_types::value::{slot_line, Value};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::{fmt, vec};
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Slots {
    /// One slot per position, `None` until assigned.
    Write(Vec<Option<Value>>),
    /// What was written; the shard file is final.
    Committed(Vec<Option<Value>>),
    Sparse { offsets: Vec<u64>, values: Vec<Value> },
    Dense(Vec<Option<Value>>),
}

/// One shard of a database: `granularity` positions from the start key on.
///
/// A write node lives in memory until `commit`, which makes the shard
/// visible in one rename. A read node loads its shard once, on `open`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    db: Database,
    key: Key,
    partial_name: PathBuf,
    slots: Slots,
}

impl Node {
    pub(crate) fn for_write(db: &Database, key: Key) -> Result<Self> {
        let partial_name = db.schema().get_partial_node_for_key(&key)?;
        let g = db.granularity();
        if (key.get_last_key() - 1) % g != 0 {
            return Err(Error::InvalidKey(format!("{} is not a shard start", key)));
        }
        shard_end(&key, g)?;
        Ok(Node {
            db: db.clone(),
            key,
            partial_name,
            slots: Slots::Write(vec![None; g as usize]),
        })
    }

    pub(crate) fn open(db: &Database, key: Key) -> Result<Self> {
        let partial_name = db.schema().get_partial_node_for_key(&key)?;
        shard_end(&key, db.granularity())?;
        let path = db.base_dir().join(&partial_name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::ShardMissing(path)),
            Err(e) => return Err(e.into()),
        };
        let mut content = String::new();
        MultiGzDecoder::new(BufReader::new(file))
            .read_to_string(&mut content)
            .map_err(|e| Error::malformed(&path, e))?;
        let slots = if db.is_sparse() {
            parse_sparse(db, &content).map_err(|e| Error::malformed(&path, e))?
        } else {
            parse_dense(db, &content).map_err(|e| Error::malformed(&path, e))?
        };
        debug!("Opened {:?} at {}", path, key);
        Ok(Node {
            db: db.clone(),
            key,
            partial_name,
            slots,
        })
    }

    pub fn start_key(&self) -> &Key {
        &self.key
    }
    /// First position past this node.
    pub fn end_pos(&self) -> u64 {
        self.key.get_last_key().saturating_add(self.db.granularity())
    }
    pub fn partial_name(&self) -> &Path {
        &self.partial_name
    }
    pub fn path(&self) -> PathBuf {
        self.db.base_dir().join(&self.partial_name)
    }
    pub fn database(&self) -> &Database {
        &self.db
    }
    pub fn is_writable(&self) -> bool {
        matches!(self.slots, Slots::Write(_))
    }

    /// Stores `value` at an absolute position on the chromosome. A later
    /// assign to the same position replaces the earlier one.
    pub fn assign<V: Into<Value>>(&mut self, position: u64, value: V) -> Result<()> {
        let value = value.into();
        let start = self.key.get_last_key();
        let max = self.db.schema().max_position(&self.key)?;
        let end = self.end_pos().min(max.saturating_add(1)).max(start);
        let expected = self.db.schema().value_type();
        let Slots::Write(buf) = &mut self.slots else {
            return Err(Error::NotWritable(self.key.to_string()));
        };
        if position < start || position >= end {
            return Err(Error::InvalidPosition { position, start, end });
        }
        if value.value_type() != expected {
            return Err(Error::TypeMismatch {
                expected,
                got: value.value_type(),
            });
        }
        buf[(position - start) as usize] = Some(value);
        Ok(())
    }

    /// Writes `<path>.tmp` and renames it onto the shard. A crash before the
    /// rename leaves any earlier shard as it was.
    pub fn commit(&mut self) -> Result<()> {
        let Slots::Write(buf) = &self.slots else {
            return Err(Error::NotWritable(self.key.to_string()));
        };
        let path = self.path();
        if let Some(dir) = path.parent() {
            create_node_dir(dir)?;
        }
        let tmp = tmp_path(&path);
        write_shard(&tmp, buf, self.db.is_sparse())?;
        fs::rename(&tmp, &path)?;
        debug!(
            "Committed {:?}: {} of {} positions set",
            path,
            buf.iter().filter(|v| v.is_some()).count(),
            buf.len()
        );
        if let Slots::Write(buf) = &mut self.slots {
            let buf = std::mem::take(buf);
            self.slots = Slots::Committed(buf);
        }
        Ok(())
    }

    /// Checks that the slots fit the schema; nodes read back from a task
    /// file were not built by `for_write` or `open`.
    pub(crate) fn check_slots(&self) -> std::result::Result<(), String> {
        let g = self.db.granularity();
        let start = self.key.get_last_key();
        if g == 0 || start == 0 || (start - 1) % g != 0 {
            return Err(format!("{} is not a shard start", self.key));
        }
        shard_end(&self.key, g).map_err(|e| e.to_string())?;
        match &self.slots {
            Slots::Write(buf) | Slots::Committed(buf) | Slots::Dense(buf) if buf.len() as u64 != g => {
                Err(format!("{} slots, expected {}", buf.len(), g))
            }
            Slots::Sparse { offsets, values }
                if offsets.len() != values.len() || offsets.iter().any(|&o| o >= g) =>
            {
                Err("sparse offsets do not match values".to_string())
            }
            _ => Ok(()),
        }
    }

    /// (key, value) pairs in position order. Sparse shards yield only the
    /// stored positions; otherwise every slot is yielded, empty or not.
    pub fn get_values(&self) -> Values {
        Values::new(self.key.clone(), self.slots.clone())
    }
    pub fn into_values(self) -> Values {
        Values::new(self.key, self.slots)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DB/Schema: {}/{} ({})",
            self.db.base_dir().display(),
            self.db.schema(),
            self.key
        )
    }
}

// First position past the shard that starts at `key`.
fn shard_end(key: &Key, granularity: u64) -> Result<u64> {
    key.get_last_key()
        .checked_add(granularity)
        .ok_or_else(|| Error::InvalidKey(format!("shard at {} runs past the last position", key)))
}

// Another writer may create the same directory at the same time.
fn create_node_dir(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn write_shard(tmp: &Path, buf: &[Option<Value>], sparse: bool) -> Result<()> {
    let mut w = GzEncoder::new(BufWriter::new(File::create(tmp)?), Compression::default());
    if sparse {
        let offsets = buf.iter().positions(Option::is_some).join("\t");
        writeln!(w, "{}", offsets)?;
        for v in buf.iter().flatten() {
            writeln!(w, "{}", v.to_line())?;
        }
    } else {
        for slot in buf {
            writeln!(w, "{}", slot_line(slot))?;
        }
    }
    let mut bw = w.finish()?;
    bw.flush()?;
    bw.into_inner().map_err(io::Error::from)?.sync_all()?;
    Ok(())
}

// All lines of a shard; every line, including the last, ends in a newline.
fn shard_lines(content: &str) -> std::result::Result<Vec<&str>, String> {
    match content.strip_suffix('\n') {
        Some(body) => Ok(body.split('\n').collect()),
        None => Err("truncated: no final newline".to_string()),
    }
}

fn parse_sparse(db: &Database, content: &str) -> std::result::Result<Slots, String> {
    let lines = shard_lines(content)?;
    let (head, rest) = lines.split_first().ok_or("no offsets line")?;
    let offsets: Vec<u64> = if head.is_empty() {
        Vec::new()
    } else {
        head.split('\t')
            .map(|o| o.parse::<u64>().map_err(|e| format!("offset {:?}: {}", o, e)))
            .collect::<std::result::Result<_, _>>()?
    };
    if offsets.iter().tuple_windows().any(|(a, b)| a >= b) {
        return Err("offsets not ascending".to_string());
    }
    if offsets.last().map_or(false, |&o| o >= db.granularity()) {
        return Err("offset past node end".to_string());
    }
    if rest.len() != offsets.len() {
        return Err(format!("{} offsets but {} values", offsets.len(), rest.len()));
    }
    let value_type = db.schema().value_type();
    let values = rest
        .iter()
        .map(|l| value_type.decode(l))
        .collect::<std::result::Result<_, _>>()?;
    Ok(Slots::Sparse { offsets, values })
}

fn parse_dense(db: &Database, content: &str) -> std::result::Result<Slots, String> {
    let lines = shard_lines(content)?;
    if lines.len() as u64 != db.granularity() {
        return Err(format!("{} lines, expected {}", lines.len(), db.granularity()));
    }
    let value_type = db.schema().value_type();
    lines
        .iter()
        .map(|l| value_type.decode_slot(l))
        .collect::<std::result::Result<_, _>>()
        .map(Slots::Dense)
}

enum ValuesInner {
    Sparse(std::iter::Zip<vec::IntoIter<u64>, vec::IntoIter<Value>>),
    Slots(vec::IntoIter<Option<Value>>),
}

/// Iterator over the contents of one node.
pub struct Values {
    key: Key,
    start: u64,
    next_pos: u64,
    inner: ValuesInner,
}

impl Values {
    fn new(key: Key, slots: Slots) -> Self {
        let start = key.get_last_key();
        let inner = match slots {
            Slots::Sparse { offsets, values } => {
                dbg_assert_eq!(offsets.len(), values.len());
                ValuesInner::Sparse(offsets.into_iter().zip(values))
            }
            Slots::Write(buf) | Slots::Committed(buf) | Slots::Dense(buf) => {
                ValuesInner::Slots(buf.into_iter())
            }
        };
        Values {
            key,
            start,
            next_pos: start,
            inner,
        }
    }
}

impl Iterator for Values {
    type Item = (Key, Option<Value>);

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            ValuesInner::Sparse(it) => it
                .next()
                .map(|(off, v)| (self.key.change_last_key(self.start + off), Some(v))),
            ValuesInner::Slots(it) => {
                let v = it.next()?;
                let key = self.key.change_last_key(self.next_pos);
                self.next_pos += 1;
                Some((key, v))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::Genome;
    use crate::new_types::value::ValueType;
    use crate::schema::Schema;

    fn db(dir: &Path, sparse: bool, value_type: ValueType) -> Database {
        let mut g = Genome::new("test", "t", 0, "");
        g.add_chrom("X", 25, None).unwrap();
        g.add_chrom("2L", 100, None).unwrap();
        Database::new(dir, Schema::genome(10, value_type, g).unwrap(), sparse)
    }

    fn gz(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut w = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        w.write_all(text.as_bytes()).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn sparse_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true, ValueType::Int);
        let mut node = db.get_write_node(Key::genomic("2L", 11)).unwrap();
        node.assign(20, 7_i64).unwrap();
        node.assign(13, -1_i64).unwrap();
        node.commit().unwrap();

        let read = db.open_node(Key::genomic("2L", 11)).unwrap();
        assert!(!read.is_writable());
        let vals: Vec<_> = read.get_values().collect();
        assert_eq!(
            vals,
            [
                (Key::genomic("2L", 13), Some(Value::Int(-1))),
                (Key::genomic("2L", 20), Some(Value::Int(7))),
            ]
        );
    }

    #[test]
    fn sparse_offsets_are_relative() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true, ValueType::Text);
        let mut node = db.get_write_node(Key::genomic("2L", 21)).unwrap();
        node.assign(21, "a").unwrap();
        node.assign(25, "b").unwrap();
        node.commit().unwrap();

        let mut content = String::new();
        MultiGzDecoder::new(File::open(node.path()).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "0\t4\na\nb\n");
    }

    #[test]
    fn dense_round_trip_keeps_empty_slots() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), false, ValueType::Float);
        let mut node = db.get_write_node(Key::genomic("X", 1)).unwrap();
        node.assign(1, 0.5).unwrap();
        node.assign(10, 2.0).unwrap();
        node.commit().unwrap();

        let vals: Vec<_> = db.open_node(Key::genomic("X", 1)).unwrap().into_values().collect();
        assert_eq!(vals.len(), 10);
        assert_eq!(vals[0], (Key::genomic("X", 1), Some(Value::Float(0.5))));
        assert_eq!(vals[9], (Key::genomic("X", 10), Some(Value::Float(2.0))));
        assert!(vals[1..9].iter().all(|(_, v)| v.is_none()));
        let positions: Vec<u64> = vals.iter().map(|(k, _)| k.get_last_key()).collect();
        assert_eq!(positions, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn last_assign_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true, ValueType::Text);
        let mut node = db.get_write_node(Key::genomic("X", 1)).unwrap();
        node.assign(3, "first").unwrap();
        node.assign(3, "second").unwrap();
        node.commit().unwrap();
        let vals: Vec<_> = db.open_node(Key::genomic("X", 1)).unwrap().into_values().collect();
        assert_eq!(vals, [(Key::genomic("X", 3), Some(Value::from("second")))]);
    }

    #[test]
    fn write_only_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true, ValueType::Int);
        let mut node = db.get_write_node(Key::genomic("X", 11)).unwrap();
        assert!(matches!(
            node.assign(10, 1_i64),
            Err(Error::InvalidPosition { position: 10, start: 11, end: 21 })
        ));
        assert!(matches!(node.assign(21, 1_i64), Err(Error::InvalidPosition { .. })));
        assert!(matches!(node.assign(12, "x"), Err(Error::TypeMismatch { .. })));
        node.assign(12, 1_i64).unwrap();
        node.commit().unwrap();
        // committed is terminal
        assert!(matches!(node.assign(12, 2_i64), Err(Error::NotWritable(_))));
        assert!(matches!(node.commit(), Err(Error::NotWritable(_))));

        let mut read = db.open_node(Key::genomic("X", 11)).unwrap();
        assert!(matches!(read.assign(12, 2_i64), Err(Error::NotWritable(_))));
        assert!(matches!(read.commit(), Err(Error::NotWritable(_))));
    }

    #[test]
    fn write_node_needs_shard_start() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true, ValueType::Int);
        assert!(matches!(
            db.get_write_node(Key::genomic("X", 5)),
            Err(Error::InvalidKey(_))
        ));
        // nothing touches the disk before commit
        let _node = db.get_write_node(Key::genomic("X", 21)).unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn stray_tmp_leaves_shard_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true, ValueType::Int);
        let mut node = db.get_write_node(Key::genomic("X", 1)).unwrap();
        node.assign(2, 1_i64).unwrap();
        node.commit().unwrap();

        // a writer that died before its rename
        gz(&tmp_path(&node.path()), "0\t1\t2\n9\n9\n9\n");
        let vals: Vec<_> = db.open_node(Key::genomic("X", 1)).unwrap().into_values().collect();
        assert_eq!(vals, [(Key::genomic("X", 2), Some(Value::Int(1)))]);

        // the next commit replaces both
        let mut node = db.get_write_node(Key::genomic("X", 1)).unwrap();
        node.assign(4, 5_i64).unwrap();
        node.commit().unwrap();
        assert!(!tmp_path(&node.path()).exists());
        let vals: Vec<_> = db.open_node(Key::genomic("X", 1)).unwrap().into_values().collect();
        assert_eq!(vals, [(Key::genomic("X", 4), Some(Value::Int(5)))]);
    }

    #[test]
    fn malformed_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let sparse = db(tmp.path(), true, ValueType::Int);
        let path = tmp.path().join("X/0000000000");
        for bad in ["", "0\t1\n5\n", "1\t0\n5\n6\n", "0\n5", "0\nfive\n", "12\n5\n"] {
            gz(&path, bad);
            let err = sparse.open_node(Key::genomic("X", 1)).unwrap_err();
            assert!(matches!(err, Error::MalformedShard { .. }), "{:?}: {}", bad, err);
        }
        fs::write(&path, b"not gzip at all").unwrap();
        assert!(matches!(
            sparse.open_node(Key::genomic("X", 1)),
            Err(Error::MalformedShard { .. })
        ));

        let dense = db(tmp.path(), false, ValueType::Int);
        gz(&path, "1\n2\n3\n");
        assert!(matches!(
            dense.open_node(Key::genomic("X", 1)),
            Err(Error::MalformedShard { .. })
        ));
    }

    #[test]
    fn task_with_wrong_slot_count() {
        use crate::dispatch::{execute_task, read_task, serialize_task, Registry};

        let tmp = tempfile::tempdir().unwrap();
        let db = db(&tmp.path().join("db"), true, ValueType::Int);
        let mut node = db.get_write_node(Key::genomic("2L", 1)).unwrap();
        node.slots = Slots::Write(vec![None; 3]);
        let task = serialize_task(&tmp.path().join("mr"), "constant", &node, &[Value::Int(1)]).unwrap();
        assert!(matches!(read_task(&task), Err(Error::MalformedTask { .. })));
        assert!(matches!(
            execute_task(&Registry::with_builtins(), &task),
            Err(Error::MalformedTask { .. })
        ));
        assert!(task.exists());
    }

    #[test]
    fn shard_end_does_not_wrap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = Genome::new("huge", "h", 0, "");
        g.add_chrom("U", u64::MAX, None).unwrap();
        let db = Database::new(tmp.path(), Schema::genome(10, ValueType::Int, g).unwrap(), true);
        let last = 1 + (u64::MAX - 1) / 10 * 10;
        assert!(matches!(
            db.get_write_node(Key::genomic("U", last)),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(db.open_node(Key::genomic("U", last)), Err(Error::InvalidKey(_))));
        let mut node = db.get_write_node(Key::genomic("U", last - 10)).unwrap();
        node.assign(last - 1, 1_i64).unwrap();
        assert_eq!(node.get_values().last().unwrap().0.get_last_key(), last - 1);
    }

    #[test]
    fn empty_sparse_node() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true, ValueType::Int);
        let mut node = db.get_write_node(Key::genomic("X", 21)).unwrap();
        node.commit().unwrap();
        assert_eq!(db.open_node(Key::genomic("X", 21)).unwrap().get_values().count(), 0);
        assert_eq!(
            node.to_string(),
            format!("DB/Schema: {}/Genome Schema: test (chromosome/position: X/21)", tmp.path().display())
        );
    }
}
