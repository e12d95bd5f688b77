//! Layered configuration merge.

pub mod merge_policy;
pub mod service;
