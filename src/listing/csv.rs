//! Safe CSV listing parser
//!
//! The full-listing body is a cursor line, a header line, one record per item
//! and a `#EOF` sentinel line. Only the name column may be quoted; a quoted
//! name can contain commas and newlines, and `""` stands for one quote.
//! Malformed records are ignored one at a time; only numeric garbage and a
//! stream ending inside an open quote stop the parse.

use crate::error::ListingError;
use crate::snapshot::SnapshotItem;
use crate::types::{NodeType, SyncTime};
use std::borrow::Cow;
use std::io::BufRead;
use tracing::{debug, warn};

/// Physical line marking the end of a complete listing
pub const EOF_SENTINEL: &str = "#EOF";

/// Column order on the wire
pub const COLUMN_COUNT: usize = 9;
const COL_ID: usize = 0;
const COL_PARENT_ID: usize = 1;
const COL_NAME: usize = 2;
const COL_TYPE: usize = 3;
const COL_SIZE: usize = 4;
const COL_CREATED_AT: usize = 5;
const COL_LAST_MODIFIED: usize = 6;
const COL_IS_LINK: usize = 7;
const COL_CAN_WRITE: usize = 8;

/// Header line matching the column order
pub const HEADER: &str = "id,parent_id,name,type,size,created_at,last_modified,is_link,can_write";

/// Why a record was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// `\"` inside a value
    EscapedQuote,
    /// Quote outside the name column, or in the middle of an unquoted value
    MisplacedQuote,
    /// Closing quote followed by something other than a comma, quote or end of line
    CharAfterClosingQuote,
    MissingColumns,
    MissingIdOrName,
}

/// Per-record scanner state, reset at the start of every record
#[derive(Debug, Default)]
pub struct ParsingState {
    pub column: usize,
    pub inside_quoted_value: bool,
    pub previous_char_was_quote: bool,
    pub previous_char_was_backslash: bool,
    pub continue_reading_next_line: bool,
    pub value: String,
}

impl ParsingState {
    pub fn reset(&mut self) {
        self.column = 0;
        self.inside_quoted_value = false;
        self.previous_char_was_quote = false;
        self.previous_char_was_backslash = false;
        self.continue_reading_next_line = false;
        self.value.clear();
    }
}

/// Raw result of reading one record
#[derive(Debug)]
pub enum RawRecord {
    Row { line: usize, columns: Vec<String> },
    Ignored { line: usize, reason: IgnoreReason },
    /// End of input; `sentinel_found` tells whether `#EOF` was seen
    End { sentinel_found: bool },
}

/// Result of parsing one record into an item
#[derive(Debug)]
pub enum ParseOutcome {
    Item(SnapshotItem),
    Ignored { line: usize, reason: IgnoreReason },
    Error(ListingError),
    Eof { sentinel_found: bool },
}

enum LineResult {
    Complete,
    NeedsMoreLines,
    Ignored(IgnoreReason),
}

/// Splits the byte stream into records, honoring quoted multi-line names
pub struct RecordReader<R> {
    reader: R,
    line_number: usize,
    state: ParsingState,
    buffer: String,
    finished: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
            state: ParsingState::default(),
            buffer: String::new(),
            finished: false,
        }
    }

    /// Number of physical lines consumed so far
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Read one physical line without its `\n`; `None` at end of stream.
    ///
    /// A `\r` before the `\n` is kept: it only terminates the line when the
    /// line ends outside a quoted name.
    pub fn read_line(&mut self) -> Result<Option<String>, ListingError> {
        self.buffer.clear();
        let read = self.reader.read_line(&mut self.buffer)?;
        if read == 0 {
            return Ok(None);
        }
        self.line_number += 1;
        let mut line = std::mem::take(&mut self.buffer);
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(Some(line))
    }

    pub fn next_record(&mut self) -> Result<RawRecord, ListingError> {
        if self.finished {
            return Ok(RawRecord::End {
                sentinel_found: true,
            });
        }
        self.state.reset();
        let mut columns = Vec::with_capacity(COLUMN_COUNT);
        let mut start_line = self.line_number + 1;

        loop {
            let line = match self.read_line()? {
                Some(line) => line,
                None if self.state.continue_reading_next_line => {
                    return Err(ListingError::UnexpectedEof { line: start_line });
                }
                None => {
                    return Ok(RawRecord::End {
                        sentinel_found: false,
                    })
                }
            };

            if !self.state.continue_reading_next_line {
                start_line = self.line_number;
                let line = line.strip_suffix('\r').unwrap_or(&line);
                if line == EOF_SENTINEL {
                    self.finished = true;
                    return Ok(RawRecord::End {
                        sentinel_found: true,
                    });
                }
                if line.is_empty() {
                    continue;
                }
            }

            match self.scan_line(&line, &mut columns) {
                LineResult::Complete => {
                    return Ok(RawRecord::Row {
                        line: start_line,
                        columns,
                    })
                }
                LineResult::NeedsMoreLines => {
                    self.state.value.push('\n');
                    self.state.continue_reading_next_line = true;
                }
                LineResult::Ignored(reason) => {
                    return Ok(RawRecord::Ignored {
                        line: start_line,
                        reason,
                    })
                }
            }
        }
    }

    fn scan_line(&mut self, line: &str, columns: &mut Vec<String>) -> LineResult {
        let state = &mut self.state;
        let (line, carriage_return) = match line.strip_suffix('\r') {
            Some(line) => (line, true),
            None => (line, false),
        };
        for c in line.chars() {
            if state.inside_quoted_value {
                if state.previous_char_was_quote {
                    state.previous_char_was_quote = false;
                    match c {
                        '"' => state.value.push('"'),
                        ',' => {
                            state.inside_quoted_value = false;
                            columns.push(std::mem::take(&mut state.value));
                            state.column += 1;
                        }
                        _ => return LineResult::Ignored(IgnoreReason::CharAfterClosingQuote),
                    }
                } else if c == '"' {
                    if state.previous_char_was_backslash {
                        return LineResult::Ignored(IgnoreReason::EscapedQuote);
                    }
                    state.previous_char_was_quote = true;
                } else {
                    state.value.push(c);
                }
            } else {
                match c {
                    ',' => {
                        columns.push(std::mem::take(&mut state.value));
                        state.column += 1;
                    }
                    '"' if state.previous_char_was_backslash => {
                        return LineResult::Ignored(IgnoreReason::EscapedQuote);
                    }
                    '"' if state.column == COL_NAME && state.value.is_empty() => {
                        state.inside_quoted_value = true;
                    }
                    '"' => return LineResult::Ignored(IgnoreReason::MisplacedQuote),
                    _ => state.value.push(c),
                }
            }
            state.previous_char_was_backslash = c == '\\';
        }

        if state.inside_quoted_value && !state.previous_char_was_quote {
            if carriage_return {
                state.value.push('\r');
            }
            return LineResult::NeedsMoreLines;
        }
        state.inside_quoted_value = false;
        state.previous_char_was_quote = false;
        state.continue_reading_next_line = false;
        columns.push(std::mem::take(&mut state.value));
        LineResult::Complete
    }
}

/// Turn the columns of one record into an item
pub fn item_from_columns(columns: &[String], line: usize) -> ParseOutcome {
    if columns.len() < COLUMN_COUNT {
        return ParseOutcome::Ignored {
            line,
            reason: IgnoreReason::MissingColumns,
        };
    }
    let id = &columns[COL_ID];
    let name = &columns[COL_NAME];
    if id.is_empty() || name.is_empty() {
        return ParseOutcome::Ignored {
            line,
            reason: IgnoreReason::MissingIdOrName,
        };
    }

    let node_type = if columns[COL_TYPE] == "dir" {
        NodeType::Directory
    } else {
        NodeType::File
    };

    let size = match parse_number("size", &columns[COL_SIZE], line) {
        Ok(size) if size < 0 => {
            return ParseOutcome::Error(ListingError::NegativeSize {
                value: columns[COL_SIZE].clone(),
                line,
            })
        }
        Ok(size) => size,
        Err(e) => return ParseOutcome::Error(e),
    };
    let created_at = match parse_number("created_at", &columns[COL_CREATED_AT], line) {
        Ok(value) => value,
        Err(e) => return ParseOutcome::Error(e),
    };
    let last_modified = match parse_number("last_modified", &columns[COL_LAST_MODIFIED], line) {
        Ok(value) => value,
        Err(e) => return ParseOutcome::Error(e),
    };

    let mut item = SnapshotItem::new(id.clone(), columns[COL_PARENT_ID].clone(), name.clone(), node_type)
        .with_size(size)
        .with_times(created_at, last_modified)
        .with_can_write(parse_flag(&columns[COL_CAN_WRITE]));
    item.is_link = parse_flag(&columns[COL_IS_LINK]);
    ParseOutcome::Item(item)
}

fn parse_number(column: &'static str, value: &str, line: usize) -> Result<SyncTime, ListingError> {
    if value.is_empty() {
        return Ok(0);
    }
    value.parse::<i64>().map_err(|_| ListingError::InvalidNumber {
        column,
        value: value.to_string(),
        line,
    })
}

fn parse_flag(value: &str) -> bool {
    value == "1"
}

/// Streaming parser for a full listing body
pub struct ListingParser<R> {
    records: RecordReader<R>,
    cursor: Option<String>,
}

impl<R: BufRead> ListingParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            records: RecordReader::new(reader),
            cursor: None,
        }
    }

    /// Consume the cursor and header lines, returning the cursor
    pub fn read_preamble(&mut self) -> Result<String, ListingError> {
        let cursor = match self.records.read_line()? {
            Some(line) if !line.trim().is_empty() => line.trim().to_string(),
            _ => return Err(ListingError::MissingHeader),
        };
        if self.records.read_line()?.is_none() {
            return Err(ListingError::MissingHeader);
        }
        self.cursor = Some(cursor.clone());
        Ok(cursor)
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn next_outcome(&mut self) -> ParseOutcome {
        match self.records.next_record() {
            Ok(RawRecord::Row { line, columns }) => item_from_columns(&columns, line),
            Ok(RawRecord::Ignored { line, reason }) => ParseOutcome::Ignored { line, reason },
            Ok(RawRecord::End { sentinel_found }) => ParseOutcome::Eof { sentinel_found },
            Err(e) => ParseOutcome::Error(e),
        }
    }
}

/// A complete full listing
#[derive(Debug, Clone, Default)]
pub struct FullListing {
    pub cursor: String,
    pub items: Vec<SnapshotItem>,
    pub ignored: usize,
}

/// Parse a whole listing body; a body without the sentinel is reported as truncated
pub fn parse_full_listing<R: BufRead>(reader: R) -> Result<FullListing, ListingError> {
    let mut parser = ListingParser::new(reader);
    let cursor = parser.read_preamble()?;
    let mut listing = FullListing {
        cursor,
        ..FullListing::default()
    };

    loop {
        match parser.next_outcome() {
            ParseOutcome::Item(item) => listing.items.push(item),
            ParseOutcome::Ignored { line, reason } => {
                debug!(line, reason = ?reason, "Ignoring listing record");
                listing.ignored += 1;
            }
            ParseOutcome::Error(e) => return Err(e),
            ParseOutcome::Eof { sentinel_found } => {
                if !sentinel_found {
                    warn!(items = listing.items.len(), "Listing ended without sentinel");
                    return Err(ListingError::Truncated);
                }
                break;
            }
        }
    }

    debug!(
        items = listing.items.len(),
        ignored = listing.ignored,
        "Parsed full listing"
    );
    Ok(listing)
}

/// Quote a name when it contains a delimiter, quote or line break
pub fn escape_name(name: &str) -> Cow<'_, str> {
    if name.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", name.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(name)
    }
}

/// Render an item as one record (no trailing newline)
pub fn to_csv(item: &SnapshotItem) -> String {
    let node_type = if item.is_dir() { "dir" } else { "file" };
    format!(
        "{},{},{},{},{},{},{},{},{}",
        item.id,
        item.parent_id,
        escape_name(&item.name),
        node_type,
        item.size,
        item.created_at,
        item.last_modified,
        u8::from(item.is_link),
        u8::from(item.can_write),
    )
}

/// Render a complete listing body, sentinel included
pub fn listing_to_csv(cursor: &str, items: &[SnapshotItem]) -> String {
    let mut body = String::new();
    body.push_str(cursor);
    body.push('\n');
    body.push_str(HEADER);
    body.push('\n');
    for item in items {
        body.push_str(&to_csv(item));
        body.push('\n');
    }
    body.push_str(EOF_SENTINEL);
    body.push('\n');
    body
}
