use std::time::SystemTime;

use bytes::{Bytes, BytesMut};

/// How the rows of one batch are framed into a single insert body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// Text formats (TabSeparated, CSV, JSONEachRow, VALUES tuples, ...): rows joined by `\n`.
    Lines,
    /// `RowBinary*` formats: rows are self-delimiting and concatenated as-is.
    Binary,
}

impl RowFormat {
    /// Derive the framing from the insert statement's `FORMAT` clause.
    pub fn for_query(query: &str) -> Self {
        let mut words = query.split_ascii_whitespace();
        while let Some(word) = words.next() {
            if word.eq_ignore_ascii_case("format") {
                return match words.next() {
                    Some(name) if name.starts_with("RowBinary") => RowFormat::Binary,
                    _ => RowFormat::Lines,
                };
            }
        }
        RowFormat::Lines
    }

    pub fn delimiter(self) -> &'static [u8] {
        match self {
            RowFormat::Lines => b"\n",
            RowFormat::Binary => b"",
        }
    }
}

/// An ordered group of rows for one target query, produced by a flush.
///
/// Fields are private: once a batch leaves the collector nothing can append to it.
#[derive(Debug, Clone)]
pub struct Batch {
    key: String,
    rows: Vec<Bytes>,
    size_bytes: usize,
    created_at: SystemTime,
    format: RowFormat,
}

impl Batch {
    pub fn new(key: impl Into<String>, rows: Vec<Bytes>, created_at: SystemTime) -> Self {
        let key = key.into();
        let format = RowFormat::for_query(&key);
        let size_bytes = rows.iter().map(Bytes::len).sum();
        Self {
            key,
            rows,
            size_bytes,
            created_at,
            format,
        }
    }

    /// Rebuild a batch from its framed content, e.g. when replaying a dump.
    ///
    /// Splitting on the delimiter and re-joining is the identity, so
    /// `from_content(k, c).content() == c` for every input.
    pub fn from_content(key: impl Into<String>, content: Bytes, created_at: SystemTime) -> Self {
        let key = key.into();
        let rows = match RowFormat::for_query(&key) {
            RowFormat::Binary => vec![content],
            RowFormat::Lines => split_lines(&content),
        };
        Self::new(key, rows, created_at)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn rows(&self) -> &[Bytes] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Sum of row payload sizes, excluding delimiters.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn format(&self) -> RowFormat {
        self.format
    }

    /// The bulk insert body: rows joined by the format delimiter, no trailing terminator.
    pub fn content(&self) -> Bytes {
        if let [only] = self.rows.as_slice() {
            return only.clone();
        }
        let delimiter = self.format.delimiter();
        let capacity = self.size_bytes + delimiter.len() * self.rows.len().saturating_sub(1);
        let mut out = BytesMut::with_capacity(capacity);
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(delimiter);
            }
            out.extend_from_slice(row);
        }
        out.freeze()
    }
}

fn split_lines(content: &Bytes) -> Vec<Bytes> {
    let mut rows = Vec::new();
    let mut start = 0;
    for (i, byte) in content.iter().enumerate() {
        if *byte == b'\n' {
            rows.push(content.slice(start..i));
            start = i + 1;
        }
    }
    rows.push(content.slice(start..));
    rows
}
