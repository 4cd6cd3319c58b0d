// (c) Roel Kluin, 2023, GPL v3

use crate::error::{Error, Result};
use crate::genome::Genome;
use crate::new_types::key::Key;
use crate::new_types::value::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Decides shard boundaries and shard file names.
///
/// Granularity is the number of positions a node covers. A sparse database
/// stores at most that many values per node, a dense one exactly that many.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Schema {
    Genome(GenomeSchema),
}

impl Schema {
    pub fn genome(granularity: u64, value_type: ValueType, genome: Genome) -> Result<Self> {
        GenomeSchema::new(granularity, value_type, genome).map(Schema::Genome)
    }
    pub fn granularity(&self) -> u64 {
        match self {
            Schema::Genome(s) => s.granularity,
        }
    }
    pub fn value_type(&self) -> ValueType {
        match self {
            Schema::Genome(s) => s.value_type,
        }
    }
    /// Start keys of all shards, in storage order. Each call starts over.
    pub fn enumerate_node_keys(&self) -> impl Iterator<Item = Key> + '_ {
        match self {
            Schema::Genome(s) => s.enumerate_node_keys(),
        }
    }
    /// Shard file name relative to the database directory.
    pub fn get_partial_node_for_key(&self, key: &Key) -> Result<PathBuf> {
        match self {
            Schema::Genome(s) => s.get_partial_node_for_key(key),
        }
    }
    /// Last position of the coordinate space the key lives in, if bounded.
    pub fn max_position(&self, key: &Key) -> Result<u64> {
        match self {
            Schema::Genome(s) => s.genome.chrom_size(chromosome_of(key)?),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Schema::Genome(s) => write!(f, "Genome Schema: {}", s.genome.name),
        }
    }
}

/// Keys are (chromosome, position); shards are `<chromosome>/<index>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenomeSchema {
    granularity: u64,
    value_type: ValueType,
    genome: Arc<Genome>,
}

impl GenomeSchema {
    pub fn new(granularity: u64, value_type: ValueType, genome: Genome) -> Result<Self> {
        if granularity == 0 {
            return Err(Error::InvalidKey("granularity must be positive".to_string()));
        }
        if let Some(bad) = genome.chrom_order().iter().find(|c| !is_path_safe(c)) {
            return Err(Error::InvalidKey(format!("chromosome {:?} cannot name a directory", bad)));
        }
        Ok(GenomeSchema {
            granularity,
            value_type,
            genome: Arc::new(genome),
        })
    }
    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    // 1 + size / granularity shards per chromosome: the last one may lie
    // entirely past the chromosome end.
    fn enumerate_node_keys(&self) -> impl Iterator<Item = Key> + '_ {
        let g = self.granularity;
        self.genome.chrom_order().iter().flat_map(move |chrom| {
            let size = self.genome.chrom_size(chrom).unwrap_or(0);
            dbg_assert!(self.genome.contains(chrom), "{} not in size map", chrom);
            (0..=size / g).map(move |i| Key::genomic(chrom, 1 + i * g))
        })
    }

    fn get_partial_node_for_key(&self, key: &Key) -> Result<PathBuf> {
        let chromosome = chromosome_of(key)?;
        if !self.genome.contains(chromosome) {
            return Err(Error::InvalidKey(format!("unknown chromosome in {}", key)));
        }
        let position = key.get_last_key();
        if position == 0 {
            return Err(Error::InvalidKey(format!("non-positive position in {}", key)));
        }
        let inner_node = (position - 1) / self.granularity;
        Ok(PathBuf::from(chromosome).join(format!("{:010}", inner_node)))
    }
}

fn chromosome_of(key: &Key) -> Result<&str> {
    key.chromosome()
        .ok_or_else(|| Error::InvalidKey(format!("no chromosome in {}", key)))
}

fn is_path_safe(chrom: &str) -> bool {
    !chrom.is_empty() && chrom != "." && chrom != ".." && !chrom.contains(&['/', '\\'][..])
}
