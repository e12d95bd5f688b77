//! Filesystem locations for configuration and per-root data.

pub mod xdg_root;
