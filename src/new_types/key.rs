// (c) Roel Kluin, 2023, GPL v3

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const CHROMOSOME: &str = "chromosome";
pub const POSITION: &str = "position";

/// An ordered tuple of named coordinate fields, e.g. (chromosome, position).
///
/// The last field is always an integer offset; it places the key within a
/// shard. Keys are values: every change produces a new key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    names: Arc<[String]>,
    fields: Vec<String>,
    last: u64,
}

impl Key {
    /// `names` holds one more entry than `fields`: the name of the last field.
    pub fn new(names: Arc<[String]>, fields: Vec<String>, last: u64) -> Self {
        dbg_assert_eq!(names.len(), fields.len() + 1);
        Key {
            names,
            fields,
            last,
        }
    }
    pub fn genomic(chromosome: &str, position: u64) -> Self {
        let names: Arc<[String]> = Arc::from(vec![CHROMOSOME.to_string(), POSITION.to_string()]);
        Key::new(names, vec![chromosome.to_string()], position)
    }
    pub fn get_last_key(&self) -> u64 {
        self.last
    }
    /// Note the result may lie past the last position the schema covers.
    pub fn inc_last_key(&self) -> Result<Self> {
        self.last
            .checked_add(1)
            .map(|last| self.change_last_key(last))
            .ok_or_else(|| Error::InvalidKey(format!("{} has no successor", self)))
    }
    pub fn change_last_key(&self, last: u64) -> Self {
        Key {
            names: Arc::clone(&self.names),
            fields: self.fields.clone(),
            last,
        }
    }
    pub fn names(&self) -> &[String] {
        &self.names
    }
    /// The leading fields, without the position.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
    /// Looks up a leading (non-position) field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .zip(self.fields.iter())
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
    pub fn chromosome(&self) -> Option<&str> {
        self.field(CHROMOSOME)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: ", self.names.join("/"))?;
        for v in &self.fields {
            write!(f, "{}/", v)?;
        }
        write!(f, "{}", self.last)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}
