mod file;

pub use file::{FileLeaseSource, FileLeaseStore};
