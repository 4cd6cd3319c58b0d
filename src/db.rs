// (c) Roel Kluin, 2023, GPL v3

use crate::error::{Error, Result};
use crate::new_types::key::Key;
use crate::new_types::value::Value;
use crate::node::{self, Node};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A directory of shards laid out by a schema.
///
/// The database keeps no per-shard state; it makes nodes and walks them.
/// Two write nodes for the same shard must not be committed concurrently:
/// the last rename wins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Database {
    base_dir: PathBuf,
    schema: Arc<Schema>,
    sparse: bool,
}

impl Database {
    pub fn new<P: AsRef<Path>>(base_dir: P, schema: Schema, sparse: bool) -> Self {
        Database {
            base_dir: base_dir.as_ref().to_path_buf(),
            schema: Arc::new(schema),
            sparse,
        }
    }
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
    pub fn schema(&self) -> &Schema {
        &self.schema
    }
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }
    pub fn granularity(&self) -> u64 {
        self.schema.granularity()
    }
    pub fn node_path(&self, key: &Key) -> Result<PathBuf> {
        Ok(self.base_dir.join(self.schema.get_partial_node_for_key(key)?))
    }
    /// Start key of the shard that holds `key`.
    pub fn shard_key(&self, key: &Key) -> Key {
        let g = self.granularity();
        let pos = key.get_last_key();
        key.change_last_key(pos - pos.saturating_sub(1) % g)
    }

    /// A fresh, empty write node; the disk is only touched on commit.
    pub fn get_write_node(&self, key: Key) -> Result<Node> {
        Node::for_write(self, key)
    }
    pub fn open_node(&self, key: Key) -> Result<Node> {
        Node::open(self, key)
    }

    /// All stored values, shard by shard in schema order. Dense shards are
    /// cut at the end of their chromosome. The first shard that cannot be
    /// read ends the iteration with its error.
    pub fn get_values(&self) -> DbValues<'_> {
        DbValues {
            db: self,
            keys: Box::new(self.schema.enumerate_node_keys()),
            current: None,
            done: false,
        }
    }

    /// Shard keys whose file is not on disk, in schema order.
    pub fn find_missing_nodes(&self) -> Result<Vec<Key>> {
        let mut missing = Vec::new();
        for key in self.schema.enumerate_node_keys() {
            if !self.node_path(&key)?.exists() {
                missing.push(key);
            }
        }
        Ok(missing)
    }

    /// Leftovers from writers that died between writing and renaming.
    pub fn stray_tmp_files(&self) -> Result<Vec<PathBuf>> {
        let mut stray = Vec::new();
        for key in self.schema.enumerate_node_keys() {
            let tmp = node::tmp_path(&self.node_path(&key)?);
            if tmp.exists() {
                stray.push(tmp);
            }
        }
        Ok(stray)
    }
}

pub struct DbValues<'a> {
    db: &'a Database,
    keys: Box<dyn Iterator<Item = Key> + 'a>,
    // the open shard and the last position of its chromosome
    current: Option<(node::Values, u64)>,
    done: bool,
}

impl<'a> Iterator for DbValues<'a> {
    type Item = Result<(Key, Option<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some((values, max)) = self.current.as_mut() {
                match values.next() {
                    Some(kv) if kv.0.get_last_key() <= *max => return Some(Ok(kv)),
                    // only a foreign writer puts a sparse value there
                    Some((key, _)) if self.db.sparse => {
                        self.done = true;
                        let path = self.db.node_path(&self.db.shard_key(&key));
                        return Some(Err(match path {
                            Ok(path) => Error::malformed(path, format!("{} past the chromosome end", key)),
                            Err(e) => e,
                        }));
                    }
                    _ => self.current = None,
                }
            }
            let Some(key) = self.keys.next() else {
                self.done = true;
                return None;
            };
            let opened = self
                .db
                .schema
                .max_position(&key)
                .and_then(|max| Ok((self.db.open_node(key)?.into_values(), max)));
            match opened {
                Ok(current) => self.current = Some(current),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::Genome;
    use crate::new_types::value::ValueType;
    use std::fs;

    fn db(dir: &Path, sparse: bool) -> Database {
        let mut g = Genome::new("test", "t", 0, "");
        g.add_chrom("X", 25, None).unwrap();
        Database::new(dir, Schema::genome(10, ValueType::Text, g).unwrap(), sparse)
    }

    #[test]
    fn shard_key_aligns_down() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true);
        for (pos, start) in [(1, 1), (5, 1), (10, 1), (11, 11), (25, 21)] {
            assert_eq!(db.shard_key(&Key::genomic("X", pos)).get_last_key(), start);
        }
    }

    #[test]
    fn missing_nodes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true);
        assert_eq!(db.find_missing_nodes().unwrap().len(), 3);
        db.get_write_node(Key::genomic("X", 11)).unwrap().commit().unwrap();
        assert_eq!(
            db.find_missing_nodes().unwrap(),
            [Key::genomic("X", 1), Key::genomic("X", 21)]
        );
        assert!(db.node_path(&Key::genomic("X", 11)).unwrap().exists());
    }

    #[test]
    fn iteration_stops_at_missing_shard() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true);
        let mut node = db.get_write_node(Key::genomic("X", 1)).unwrap();
        node.assign(5, "A").unwrap();
        node.commit().unwrap();

        let mut values = db.get_values();
        assert_eq!(values.next().unwrap().unwrap().0, Key::genomic("X", 5));
        assert!(matches!(values.next(), Some(Err(Error::ShardMissing(_)))));
        assert!(values.next().is_none());
    }

    #[test]
    fn nothing_stored_past_chromosome_end() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true);
        for start in [1, 11] {
            db.get_write_node(Key::genomic("X", start)).unwrap().commit().unwrap();
        }
        let mut node = db.get_write_node(Key::genomic("X", 21)).unwrap();
        assert!(matches!(
            node.assign(30, "Z"),
            Err(Error::InvalidPosition { position: 30, start: 21, end: 26 })
        ));
        node.assign(25, "Y").unwrap();
        node.commit().unwrap();
        let values: Vec<_> = db.get_values().collect::<Result<_>>().unwrap();
        assert_eq!(values, [(Key::genomic("X", 25), Some(Value::from("Y")))]);
    }

    #[test]
    fn sparse_value_past_end_is_an_error() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), true);
        for start in [1, 11] {
            db.get_write_node(Key::genomic("X", start)).unwrap().commit().unwrap();
        }
        let path = db.node_path(&Key::genomic("X", 21)).unwrap();
        let mut w = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
        w.write_all(b"9\nZ\n").unwrap();
        w.finish().unwrap();

        // the node itself still shows it
        assert_eq!(db.open_node(Key::genomic("X", 21)).unwrap().get_values().count(), 1);
        let res: Result<Vec<_>> = db.get_values().collect();
        assert!(matches!(res, Err(Error::MalformedShard { ref path, .. }) if path.ends_with("X/0000000002")));
    }

    #[test]
    fn stray_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let db = db(tmp.path(), false);
        let path = db.node_path(&Key::genomic("X", 21)).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(node::tmp_path(&path), b"half").unwrap();
        assert_eq!(db.stray_tmp_files().unwrap(), [node::tmp_path(&path)]);
        // a stray tmp is not a shard
        assert_eq!(db.find_missing_nodes().unwrap().len(), 3);
    }
}
