//! Wire-format tokenizing and the `key="value", …` payload grammar.
//!
//! The payload grammar (`parse_group`) is a direct port of
//! `Datafile.h::parseKeyValueVector`, extended to also recognize its
//! own closing `)` so it can double as the group-boundary scanner: the
//! original never actually implemented the outer `please:<verb> <table>
//! (...) where (...)` tokenizer (`Database.h`'s `startChildThread` hard-
//! codes `"tableName"` and forwards the raw request untouched), so that
//! layer is built here to match the documented request grammar rather
//! than translated.
//!
//! Password columns are the one place the two concerns can't be
//! separated: a digest's raw bytes might coincidentally contain a `)`
//! or `,`, so boundary detection must already know a key's column type
//! while scanning. That is why `parse_group` takes a `column_type`
//! lookup instead of leaving boundary-finding to a separate pass.

use crate::column::ColumnType;
use crate::datafile::ColumnValues;
use crate::error::{Error, Result};
use crate::ids::DIGEST_WIDTH;

const PREFIX: &[u8] = b"please:";

/// Strips the case-insensitive `please:` prefix. Fails with the fixed
/// `"parse error."` sentinel wording used for every malformed request.
pub fn strip_prefix(line: &[u8]) -> Result<&[u8]> {
    if line.len() < PREFIX.len() || !line[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        return Err(Error::Parse("parse error.".to_string()));
    }
    Ok(&line[PREFIX.len()..])
}

/// Splits off the next whitespace-delimited ASCII token, skipping any
/// leading whitespace. Returns `(token, rest)`.
pub fn take_word(bytes: &[u8]) -> (&[u8], &[u8]) {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let rest = &bytes[start..];
    let end = rest.iter().position(|b| b.is_ascii_whitespace()).unwrap_or(rest.len());
    (&rest[..end], &rest[end..])
}

fn ascii_word(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| Error::Parse("expected an ASCII token".to_string()))
}

/// Finds the next `(`, optionally requiring a literal keyword (`set`,
/// `where`) immediately before it. Returns the index just past the `(`.
pub fn find_group_open(bytes: &[u8], expect_keyword: Option<&str>) -> Result<usize> {
    let mut i = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    if let Some(keyword) = expect_keyword {
        let (word, _) = take_word(&bytes[i..]);
        if !word.eq_ignore_ascii_case(keyword.as_bytes()) {
            return Err(Error::Parse(format!("parse error. expected '{keyword}'.")));
        }
        i += word.len();
        i += bytes[i..].iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len() - i);
    }
    if bytes.get(i) != Some(&b'(') {
        return Err(Error::Parse("parse error. expected '('.".to_string()));
    }
    Ok(i + 1)
}

fn finalize_pair(result: &mut ColumnValues, key: &mut String, value: &mut Vec<u8>) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::Parse("parse error. key is empty.".to_string()));
    }
    if value.is_empty() {
        return Err(Error::Parse("parse error. value is empty.".to_string()));
    }
    result.insert(key.trim().to_ascii_lowercase(), std::mem::take(value));
    key.clear();
    Ok(())
}

/// Parses one parenthesized `key="value", …` group starting at
/// `bytes[start]` (the byte right after the opening `(`). Stops at the
/// first unquoted `)`, returning the parsed values and the index just
/// past it.
///
/// Grammar (ported from `parseKeyValueVector`):
/// - keys are `[A-Za-z0-9_]`, leading spaces tolerated, embedded spaces
///   are an error;
/// - values are double-quoted; `\\` and `\"` are the only escapes;
///   commas inside quotes are literal;
/// - a column whose type is `password` consumes exactly
///   [`DIGEST_WIDTH`] raw bytes with no escape interpretation, and is
///   written on the wire unquoted.
pub fn parse_group(
    bytes: &[u8],
    start: usize,
    column_type: impl Fn(&str) -> Option<ColumnType>,
) -> Result<(ColumnValues, usize)> {
    let mut result = ColumnValues::new();
    let mut key = String::new();
    let mut value: Vec<u8> = Vec::new();
    let mut is_escape = false;
    let mut in_quotes = false;
    let mut is_key = true;
    let mut is_value = false;

    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        let c = b as char;

        if is_value
            && column_type(&key.trim().to_ascii_lowercase()) == Some(ColumnType::Password)
            && value.len() != DIGEST_WIDTH
        {
            value.push(b);
            i += 1;
            continue;
        }

        if is_key && !(c.is_ascii_alphanumeric() || c == '_' || c == '=') {
            let key_is_blank = key.trim().is_empty();
            if !(key_is_blank && c == ' ') {
                return Err(Error::Parse(format!("parse error. key cannot contain '{c}'.")));
            }
        }

        match c {
            '=' if is_key => {
                is_key = false;
                is_value = true;
            }
            '=' if is_value => {
                value.push(b);
                is_escape = false;
            }
            '\\' => {
                if is_escape {
                    value.push(b);
                    is_escape = false;
                } else {
                    is_escape = true;
                }
            }
            '"' => {
                if is_escape {
                    value.push(b);
                } else {
                    in_quotes = !in_quotes;
                }
                is_escape = false;
            }
            ',' if !in_quotes => {
                finalize_pair(&mut result, &mut key, &mut value)?;
                is_key = true;
                is_value = false;
                is_escape = false;
            }
            ',' => {
                value.push(b);
                is_escape = false;
            }
            ')' if !in_quotes => {
                if !key.trim().is_empty() || !value.is_empty() {
                    finalize_pair(&mut result, &mut key, &mut value)?;
                }
                return Ok((result, i + 1));
            }
            _ => {
                if is_key && c != ' ' {
                    key.push(c);
                }
                if is_value {
                    value.push(b);
                }
                is_escape = false;
            }
        }
        i += 1;
    }
    Err(Error::Parse("parse error. missing ')'.".to_string()))
}

/// Escapes a value's bytes for the quoted-string form of the grammar
/// above (used by [`encode_row`] and by driver-side query building).
/// Works byte-for-byte rather than through `char`: a pass through
/// `as char`/`String` would re-encode any byte ≥ 0x80 as a multi-byte
/// UTF-8 sequence, which is fatal for a column like `password` whose
/// bytes are an effectively random digest.
pub fn escape_value(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'"' => out.extend_from_slice(b"\\\""),
            _ => out.push(b),
        }
    }
    out
}

/// One fully tokenized request line, minus any value groups (those are
/// decoded separately once the table's column types are known).
pub struct RequestLine {
    pub verb: String,
    pub table: Option<String>,
    pub args: Vec<String>,
}

/// Tokenizes `please:<verb> [<table>] [<args...>]` down to the verb,
/// an optional table name, and any remaining plain-word arguments
/// (used by `user <name> <password>`). Parenthesized groups are left
/// in the returned remainder for the caller to decode with
/// [`parse_group`] once it has resolved a table descriptor.
pub fn split_request<'a>(line: &'a [u8]) -> Result<(RequestLine, &'a [u8])> {
    let rest = strip_prefix(line)?;
    let (verb_bytes, rest) = take_word(rest);
    if verb_bytes.is_empty() {
        return Err(Error::Parse("parse error. missing verb.".to_string()));
    }
    let verb = ascii_word(verb_bytes)?.to_ascii_lowercase();

    match verb.as_str() {
        "transaction" | "commit" | "rollback" | "close" => Ok((
            RequestLine { verb, table: None, args: Vec::new() },
            rest,
        )),
        "user" => {
            let (name, rest) = take_word(rest);
            let (password, rest) = take_word(rest);
            if name.is_empty() || password.is_empty() {
                return Err(Error::Parse("parse error. 'user' requires a name and a password.".to_string()));
            }
            Ok((
                RequestLine { verb, table: None, args: vec![ascii_word(name)?, ascii_word(password)?] },
                rest,
            ))
        }
        "insert" | "update" | "delete" | "select" => {
            let (table, rest) = take_word(rest);
            if table.is_empty() {
                return Err(Error::Parse("parse error. missing table name.".to_string()));
            }
            Ok((
                RequestLine { verb, table: Some(ascii_word(table)?.to_ascii_lowercase()), args: Vec::new() },
                rest,
            ))
        }
        other => Err(Error::Parse(format!("parse error. unknown verb '{other}'."))),
    }
}

/// Renders one result row in the same grammar `parse_group` consumes,
/// so a client can decode it with [`decode_row`]. The original never
/// implemented a select-response format; this one is new but
/// self-consistent with the request grammar it sits beside: string and
/// datetime columns are quoted and escaped, `password` columns are
/// emitted raw and unquoted (exactly [`crate::ids::DIGEST_WIDTH`]
/// bytes, matching how `parse_group` consumes them on the way in).
/// Operates on raw bytes throughout so non-ASCII column values round
/// trip through [`decode_row`] byte-for-byte.
pub fn encode_row(row: &ColumnValues, columns: &[crate::column::Column]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(col.name.as_bytes());
        out.push(b'=');
        if let Some(bytes) = row.get(&col.name) {
            if col.ty == ColumnType::Password {
                out.extend_from_slice(bytes);
            } else {
                out.push(b'"');
                out.extend_from_slice(&escape_value(bytes));
                out.push(b'"');
            }
        }
    }
    out
}

/// Inverse of [`encode_row`]: parses one result-row line back into
/// column values.
pub fn decode_row(line: &[u8], column_type: impl Fn(&str) -> Option<ColumnType>) -> Result<ColumnValues> {
    let mut wrapped = Vec::with_capacity(line.len() + 1);
    wrapped.extend_from_slice(line);
    wrapped.push(b')');
    let (values, _) = parse_group(&wrapped, 0, column_type)?;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_password(_: &str) -> Option<ColumnType> {
        None
    }

    #[test]
    fn parses_quoted_values_with_escapes() {
        let input = br#"order_name="order1", note="a \"quoted\" word")"#;
        let (values, consumed) = parse_group(input, 0, no_password).unwrap();
        assert_eq!(values["order_name"], b"order1");
        assert_eq!(values["note"], b"a \"quoted\" word");
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn comma_inside_quotes_is_literal() {
        let input = br#"name="a,b")"#;
        let (values, _) = parse_group(input, 0, no_password).unwrap();
        assert_eq!(values["name"], b"a,b");
    }

    #[test]
    fn empty_group_yields_no_values() {
        let input = b")";
        let (values, consumed) = parse_group(input, 0, no_password).unwrap();
        assert!(values.is_empty());
        assert_eq!(consumed, 1);
    }

    #[test]
    fn password_column_consumes_exactly_32_raw_bytes() {
        let mut input = b"password=".to_vec();
        input.extend(std::iter::repeat(b')').take(DIGEST_WIDTH));
        input.push(b')');
        let (values, consumed) =
            parse_group(&input, 0, |k| if k == "password" { Some(ColumnType::Password) } else { None }).unwrap();
        assert_eq!(values["password"].len(), DIGEST_WIDTH);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn rejects_embedded_space_in_key() {
        let input = b"or der=\"x\")";
        assert!(parse_group(input, 0, no_password).is_err());
    }

    #[test]
    fn splits_insert_request_into_verb_and_table() {
        let line = br#"please:insert order (order_name="order1")"#;
        let (req, rest) = split_request(line).unwrap();
        assert_eq!(req.verb, "insert");
        assert_eq!(req.table.as_deref(), Some("order"));
        let open = find_group_open(rest, None).unwrap();
        let (values, _) = parse_group(rest, open, no_password).unwrap();
        assert_eq!(values["order_name"], b"order1");
    }

    #[test]
    fn missing_please_prefix_is_a_parse_error() {
        assert!(split_request(b"insert order (x=\"1\")").is_err());
    }

    fn string_column(name: &str, offset: usize, width: usize) -> crate::column::Column {
        crate::column::Column { name: name.to_string(), ty: ColumnType::String, width, offset }
    }

    fn password_column(name: &str, offset: usize) -> crate::column::Column {
        crate::column::Column { name: name.to_string(), ty: ColumnType::Password, width: DIGEST_WIDTH, offset }
    }

    #[test]
    fn row_round_trips_through_encode_decode() {
        let mut row = ColumnValues::new();
        row.insert("order_name".to_string(), b"order1".to_vec());
        let columns = vec![string_column("order_name", 0, 32)];
        let line = encode_row(&row, &columns);
        let decoded = decode_row(&line, no_password).unwrap();
        assert_eq!(decoded["order_name"], b"order1");
    }

    #[test]
    fn row_round_trips_non_ascii_bytes() {
        let mut row = ColumnValues::new();
        let raw: Vec<u8> = (0u8..=255).collect();
        row.insert("note".to_string(), raw.clone());
        let columns = vec![string_column("note", 0, raw.len())];
        let line = encode_row(&row, &columns);
        let decoded = decode_row(&line, no_password).unwrap();
        assert_eq!(decoded["note"], raw);
    }

    #[test]
    fn password_column_is_encoded_raw_and_unquoted() {
        let mut row = ColumnValues::new();
        // A digest is effectively random bytes; deliberately include
        // the grammar's own special characters (quote, backslash,
        // comma, both parens) to prove they pass through unescaped.
        let mut digest: Vec<u8> = b"\"\\,()".to_vec();
        digest.resize(DIGEST_WIDTH, 0xAB);
        row.insert("password".to_string(), digest.clone());
        let columns = vec![password_column("password", 0)];
        let line = encode_row(&row, &columns);

        // No surrounding quotes: the digest bytes follow '=' directly.
        assert_eq!(&line[..b"password=".len()], b"password=");
        assert_eq!(&line[b"password=".len()..], digest.as_slice());

        let decoded = decode_row(&line, |k| if k == "password" { Some(ColumnType::Password) } else { None }).unwrap();
        assert_eq!(decoded["password"], digest);
    }
}
