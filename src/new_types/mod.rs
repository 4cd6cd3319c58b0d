// (c) Roel Kluin, 2023, GPL v3

pub mod key;
pub mod value;
