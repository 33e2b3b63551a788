//! Sparse extent internals (`spec.md` §4.C, §4.D, §4.E): header decoding,
//! grain directory/table loading, and the bounded grain cache.

pub mod cache;
pub mod directory;
pub mod header;
