//! Configuration sources, lowest precedence first: global file, sync-root file, environment.

pub mod environment;
pub mod global_file;
pub mod root_file;
