//! Comment hint extraction.
//!
//! Hints ride in SQL comments addressed to the proxy:
//!
//! ```sql
//! SELECT a FROM t; -- hermes route to server db-west-2
//! SELECT b FROM t /* hermes max_slave_replication_lag=30 */;
//! ```
//!
//! The scan walks comment spans only; the statement text itself is never
//! interpreted.

use super::Hint;

/// Extract the hint chain from a COM_QUERY payload (command byte included)
pub fn parse_hints(payload: &[u8]) -> Vec<Hint> {
    let Some(sql) = payload.get(1..) else {
        return Vec::new();
    };
    let sql = String::from_utf8_lossy(sql);

    let mut hints = Vec::new();
    for comment in comment_spans(&sql) {
        if let Some(hint) = parse_comment(comment) {
            hints.push(hint);
        }
    }
    hints
}

/// Comment bodies in source order
fn comment_spans(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    let start = i + 2;
                    let end = sql[start..]
                        .find("*/")
                        .map(|p| start + p)
                        .unwrap_or(sql.len());
                    spans.push(&sql[start..end]);
                    i = end + 1;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-')
                    && bytes.get(i + 2).is_some_and(|c| c.is_ascii_whitespace()) =>
                {
                    let start = i + 2;
                    let end = sql[start..]
                        .find('\n')
                        .map(|p| start + p)
                        .unwrap_or(sql.len());
                    spans.push(&sql[start..end]);
                    i = end;
                }
                b'#' => {
                    let start = i + 1;
                    let end = sql[start..]
                        .find('\n')
                        .map(|p| start + p)
                        .unwrap_or(sql.len());
                    spans.push(&sql[start..end]);
                    i = end;
                }
                _ => {}
            },
        }
        i += 1;
    }

    spans
}

fn parse_comment(comment: &str) -> Option<Hint> {
    let mut words = comment.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("hermes") {
        return None;
    }

    let directive: Vec<&str> = words.collect();

    match directive.as_slice() {
        ["route", "to", "master"] => Some(Hint::RouteToMaster),
        ["route", "to", "slave"] => Some(Hint::RouteToSlave),
        ["route", "to", "server", name] => Some(Hint::RouteToNamedServer(name.to_string())),
        ["route", "to", "all"] => Some(Hint::RouteToAll),
        ["route", "to", "uptodate", "server"] => Some(Hint::RouteToUptodateServer),
        [parameter] if parameter.contains('=') => {
            let (key, value) = parameter.split_once('=')?;
            Some(Hint::Parameter {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            })
        }
        [key, "=", value] => Some(Hint::Parameter {
            key: key.to_string(),
            value: value.to_string(),
        }),
        _ => None,
    }
}
