//! Remote listing ingestion: full CSV listings and cursor-based increments.

pub mod csv;
pub mod incremental;

pub use csv::{
    escape_name, item_from_columns, listing_to_csv, parse_full_listing, to_csv, FullListing,
    IgnoreReason, ListingParser, ParseOutcome, ParsingState, RawRecord, RecordReader,
    EOF_SENTINEL,
};
pub use incremental::{
    clamp_listen_timeout, ActionKind, Capabilities, ContinueResponse, ListenResponse,
    ListingAction, RemoteFile, MAX_LISTEN_TIMEOUT,
};

/// Query parameters of a listing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRequest {
    pub directory_id: String,
    pub recursive: bool,
    pub cursor: Option<String>,
    pub limit: usize,
}

impl ListingRequest {
    pub fn full(directory_id: impl Into<String>, limit: usize) -> Self {
        Self {
            directory_id: directory_id.into(),
            recursive: true,
            cursor: None,
            limit,
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("directory_id", self.directory_id.clone()),
            ("recursive", self.recursive.to_string()),
            ("limit", self.limit.to_string()),
            ("format", "safe_csv".to_string()),
            ("with", "capabilities,is_link".to_string()),
        ];
        if let Some(cursor) = &self.cursor {
            pairs.push(("cursor", cursor.clone()));
        }
        pairs
    }
}
