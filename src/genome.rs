// (c) Roel Kluin, 2023, GPL v3

use crate::error::{Error, Result};
use ahash::AHashMap;
use noodles_fasta as fasta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Centromere position
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CentroPos {
    Left,
    Right,
    Center,
}

pub type Chrom = (u64, Option<CentroPos>);

/// Chromosome layout of a genome. `chrom_order` drives shard enumeration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genome {
    pub name: String,
    pub short_name: String,
    pub taxid: u32,
    pub desc: String,
    chrom_order: Vec<String>,
    chroms: AHashMap<String, Chrom>,
}

impl Genome {
    pub fn new(name: &str, short_name: &str, taxid: u32, desc: &str) -> Self {
        Genome {
            name: name.to_string(),
            short_name: short_name.to_string(),
            taxid,
            desc: desc.to_string(),
            chrom_order: Vec::new(),
            chroms: AHashMap::new(),
        }
    }
    pub fn add_chrom(&mut self, chrom: &str, size: u64, centro: Option<CentroPos>) -> Result<()> {
        if self.chroms.contains_key(chrom) {
            return Err(Error::InvalidKey(format!(
                "chromosome {} already in {}",
                chrom, self.short_name
            )));
        }
        self.chroms.insert(chrom.to_string(), (size, centro));
        self.chrom_order.push(chrom.to_string());
        Ok(())
    }
    /// Chromosome sizes from a FASTA reference, in file order.
    pub fn from_fasta<P: AsRef<Path>>(
        path: P,
        name: &str,
        short_name: &str,
        taxid: u32,
        desc: &str,
    ) -> Result<Self> {
        let mut reader = File::open(path)
            .map(BufReader::new)
            .map(fasta::Reader::new)?;
        let mut genome = Genome::new(name, short_name, taxid, desc);
        for res in reader.records() {
            let record = res?;
            genome.add_chrom(record.name(), record.sequence().len() as u64, None)?;
        }
        Ok(genome)
    }
    /// A copy without the given chromosomes; `self` is left as is.
    pub fn without_chroms(&self, remove: &[&str]) -> Self {
        let mut genome = self.clone();
        genome.chrom_order.retain(|c| !remove.contains(&c.as_str()));
        genome.chroms.retain(|c, _| !remove.contains(&c.as_str()));
        genome
    }
    pub fn chrom_order(&self) -> &[String] {
        &self.chrom_order
    }
    pub fn chrom(&self, chrom: &str) -> Result<Chrom> {
        self.chroms
            .get(chrom)
            .copied()
            .ok_or_else(|| Error::InvalidKey(format!("unknown chromosome {} in {}", chrom, self.short_name)))
    }
    pub fn chrom_size(&self, chrom: &str) -> Result<u64> {
        self.chrom(chrom).map(|c| c.0)
    }
    pub fn contains(&self, chrom: &str) -> bool {
        self.chroms.contains_key(chrom)
    }
    pub fn total_size(&self) -> u64 {
        self.chroms.values().map(|c| c.0).sum()
    }

    /// Preloaded genomes by short name.
    pub fn builtin(short_name: &str) -> Option<Genome> {
        match short_name {
            "Ag" => Some(anopheles_gambiae()),
            _ => None,
        }
    }
}

fn anopheles_gambiae() -> Genome {
    let mut ag = Genome::new("Anopheles gambiae PEST v3", "Ag", 180454, "Ag PEST v3");
    for (chrom, size, centro) in [
        ("2R", 61_545_105, Some(CentroPos::Right)),
        ("2L", 49_364_325, Some(CentroPos::Left)),
        ("3R", 53_200_684, Some(CentroPos::Right)),
        ("3L", 41_963_435, Some(CentroPos::Left)),
        ("X", 24_393_108, Some(CentroPos::Right)),
        ("UNKN", 42_389_979, None),
    ] {
        ag.chroms.insert(chrom.to_string(), (size, centro));
        ag.chrom_order.push(chrom.to_string());
    }
    ag
}

impl fmt::Display for Genome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Species: {} ({}, taxid: {})", self.name, self.short_name, self.taxid)?;
        writeln!(f, "{}", self.desc)?;
        writeln!(f, "{:?}", self.chrom_order)?;
        for c in &self.chrom_order {
            let (size, centro) = self.chroms[c];
            writeln!(f, "{}\t{}\t{:?}", c, size, centro)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_ag() {
        let ag = Genome::builtin("Ag").unwrap();
        assert_eq!(ag.chrom_order(), ["2R", "2L", "3R", "3L", "X", "UNKN"]);
        assert_eq!(ag.chrom_size("X").unwrap(), 24_393_108);
        assert_eq!(ag.chrom("UNKN").unwrap().1, None);
        assert!(Genome::builtin("Hs").is_none());
    }

    #[test]
    fn removal_does_not_touch_source() {
        let ag = Genome::builtin("Ag").unwrap();
        let autosomes = ag.without_chroms(&["X", "UNKN"]);
        assert_eq!(autosomes.chrom_order(), ["2R", "2L", "3R", "3L"]);
        assert!(!autosomes.contains("X"));
        assert!(ag.contains("X"));
        assert_eq!(ag.chrom_order().len(), 6);
    }

    #[test]
    fn duplicate_chrom() {
        let mut g = Genome::new("test", "t", 1, "");
        g.add_chrom("1", 10, None).unwrap();
        assert!(matches!(g.add_chrom("1", 20, None), Err(Error::InvalidKey(_))));
        assert!(matches!(g.chrom_size("2"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn sizes_from_fasta() {
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(temp_file, ">chrA\nATCGATCG\nAT\n>chrB\nGCTA").unwrap();
        let g = Genome::from_fasta(temp_file.path(), "test", "t", 0, "fasta").unwrap();
        assert_eq!(g.chrom_order(), ["chrA", "chrB"]);
        assert_eq!(g.chrom_size("chrA").unwrap(), 10);
        assert_eq!(g.chrom_size("chrB").unwrap(), 4);
        assert_eq!(g.total_size(), 14);
    }
}
