//! Import of DOAS fit results from delimited text files.

pub mod data;
