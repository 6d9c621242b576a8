use bytes::Bytes;

use crate::batch::RowFormat;

const VALUES: &str = "VALUES";

/// One intake request split into its buffering key and rows.
#[derive(Debug, PartialEq)]
pub struct Insert {
    pub key: String,
    pub rows: Vec<Bytes>,
}

/// Split a request into the statement that keys the buffer and the rows it carries.
///
/// The statement comes from the `query` parameter, or from the first body line
/// when the parameter is absent. `... VALUES (..)` statements are keyed by the
/// text up to `VALUES` and the inline tuples become a row. `FORMAT` bodies are
/// split on `\n` with blank lines dropped, except `RowBinary*` bodies which
/// stay whole.
pub fn parse(query: Option<&str>, body: Bytes) -> Result<Insert, &'static str> {
    let (statement, data) = match query.map(str::trim).filter(|q| !q.is_empty()) {
        Some(query) => (query.to_owned(), body),
        None => split_statement(body)?,
    };

    let verb = statement.split_ascii_whitespace().next().unwrap_or_default();
    if !verb.eq_ignore_ascii_case("insert") {
        return Err("only INSERT statements are accepted");
    }

    let mut rows = Vec::new();
    let key = match values_clause(&statement) {
        Some(end) => {
            let inline = statement[end..].trim();
            if !inline.is_empty() {
                rows.push(Bytes::copy_from_slice(inline.as_bytes()));
            }
            let data = trim_ascii(data);
            if !data.is_empty() {
                rows.push(data);
            }
            statement[..end].trim_end().to_owned()
        }
        None => {
            match RowFormat::for_query(&statement) {
                RowFormat::Binary if !data.is_empty() => rows.push(data),
                RowFormat::Binary => {}
                RowFormat::Lines => push_lines(&mut rows, &data),
            }
            statement
        }
    };

    if rows.is_empty() {
        return Err("no rows in request");
    }
    Ok(Insert { key, rows })
}

fn split_statement(body: Bytes) -> Result<(String, Bytes), &'static str> {
    let (head, data) = match body.iter().position(|b| *b == b'\n') {
        Some(newline) => (body.slice(..newline), body.slice(newline + 1..)),
        None => (body.clone(), Bytes::new()),
    };
    let statement = std::str::from_utf8(&head).map_err(|_| "statement is not valid UTF-8")?;
    let statement = statement.trim();
    if statement.is_empty() {
        return Err("missing statement");
    }
    Ok((statement.to_owned(), data))
}

/// Byte offset just past a standalone `VALUES` keyword, if the statement has one.
fn values_clause(statement: &str) -> Option<usize> {
    let upper = statement.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    upper
        .match_indices(VALUES)
        .map(|(start, _)| start)
        .find(|&start| {
            let end = start + VALUES.len();
            (start == 0 || !is_word(bytes[start - 1])) && bytes.get(end).is_none_or(|b| !is_word(*b))
        })
        .map(|start| start + VALUES.len())
}

fn push_lines(rows: &mut Vec<Bytes>, data: &Bytes) {
    let mut start = 0;
    for (i, b) in data.iter().enumerate() {
        if *b == b'\n' {
            push_line(rows, data.slice(start..i));
            start = i + 1;
        }
    }
    push_line(rows, data.slice(start..));
}

fn push_line(rows: &mut Vec<Bytes>, line: Bytes) {
    let line = match line.last() {
        Some(b'\r') => line.slice(..line.len() - 1),
        _ => line,
    };
    if !line.is_empty() {
        rows.push(line);
    }
}

fn trim_ascii(data: Bytes) -> Bytes {
    let Some(start) = data.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Bytes::new();
    };
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(data.len(), |i| i + 1);
    data.slice(start..end)
}
