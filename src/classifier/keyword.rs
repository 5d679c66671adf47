//! Default classifier: first-keyword inspection of the statement text.
//!
//! Good enough to drive the router when no richer classifier is plugged in.
//! Uncertain statements classify as UNKNOWN, which the router treats as a
//! write; erring toward the primary is always safe.

use super::{Classify, Operation, QueryType};
use crate::protocol::Command;

pub struct KeywordClassifier;

impl Classify for KeywordClassifier {
    fn classify(&self, payload: &[u8]) -> (QueryType, Operation) {
        let Some((&first, sql)) = payload.split_first() else {
            return (QueryType::empty(), Operation::Undefined);
        };

        let command = Command::from(first);
        let sql = String::from_utf8_lossy(sql);
        let (mut qtype, op) = classify_sql(&sql);

        if command == Command::StmtPrepare {
            qtype |= QueryType::PREPARE_STMT;
        }

        (qtype, op)
    }
}

fn classify_sql(sql: &str) -> (QueryType, Operation) {
    let trimmed = strip_leading_comments(sql.trim());
    let upper = trimmed.to_uppercase();

    if let Some(rest) = upper.strip_prefix("SELECT") {
        if rest.contains("@@") {
            let qtype = if rest.contains("@@GLOBAL") {
                QueryType::GSYSVAR_READ
            } else {
                QueryType::SYSVAR_READ
            };
            return (qtype, Operation::Select);
        }
        if rest.contains('@') {
            return (QueryType::USERVAR_READ, Operation::Select);
        }
        if rest.contains("FOR UPDATE") {
            return (QueryType::WRITE, Operation::Select);
        }
        return (QueryType::READ, Operation::Select);
    }

    if upper.starts_with("INSERT") || upper.starts_with("REPLACE") {
        return (QueryType::WRITE, Operation::Insert);
    }
    if upper.starts_with("UPDATE") {
        return (QueryType::WRITE, Operation::Update);
    }
    if upper.starts_with("DELETE") || upper.starts_with("TRUNCATE") {
        return (QueryType::WRITE, Operation::Delete);
    }

    if upper.starts_with("CREATE TEMPORARY TABLE") {
        return (
            QueryType::WRITE | QueryType::CREATE_TMP_TABLE,
            Operation::Undefined,
        );
    }
    if upper.starts_with("CREATE") || upper.starts_with("DROP") || upper.starts_with("ALTER") {
        return (QueryType::WRITE, Operation::Undefined);
    }

    if upper.starts_with("SET") {
        // compare with whitespace squeezed out: SET autocommit = 0
        let squeezed: String = upper.chars().filter(|c| !c.is_whitespace()).collect();
        if squeezed.starts_with("SETAUTOCOMMIT=0") {
            return (
                QueryType::SESSION_WRITE | QueryType::DISABLE_AUTOCOMMIT,
                Operation::Undefined,
            );
        }
        if squeezed.starts_with("SETAUTOCOMMIT=1") {
            return (
                QueryType::SESSION_WRITE | QueryType::ENABLE_AUTOCOMMIT,
                Operation::Undefined,
            );
        }
        if upper.starts_with("SET GLOBAL") {
            return (QueryType::GSYSVAR_WRITE, Operation::Undefined);
        }
        if squeezed.starts_with("SET@") && !squeezed.starts_with("SET@@") {
            return (QueryType::USERVAR_WRITE, Operation::Undefined);
        }
        return (QueryType::SESSION_WRITE, Operation::Undefined);
    }

    if upper.starts_with("USE") {
        return (QueryType::SESSION_WRITE, Operation::Undefined);
    }

    if upper.starts_with("SHOW TABLES") {
        return (QueryType::SHOW_TABLES, Operation::Undefined);
    }
    if upper.starts_with("SHOW")
        || upper.starts_with("DESCRIBE")
        || upper.starts_with("DESC")
        || upper.starts_with("EXPLAIN")
    {
        return (QueryType::READ, Operation::Undefined);
    }

    if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
        let mut qtype = QueryType::BEGIN_TRX;
        if upper.contains("READ ONLY") {
            qtype |= QueryType::READ;
        }
        return (qtype, Operation::Undefined);
    }
    if upper.starts_with("COMMIT") {
        return (QueryType::COMMIT, Operation::Undefined);
    }
    if upper.starts_with("ROLLBACK") {
        return (QueryType::ROLLBACK, Operation::Undefined);
    }

    if upper.starts_with("PREPARE") {
        // named prepares scope session state and replay on every backend
        return (
            QueryType::SESSION_WRITE | QueryType::PREPARE_NAMED_STMT,
            Operation::Undefined,
        );
    }
    if upper.starts_with("EXECUTE") {
        return (QueryType::EXEC_STMT, Operation::Undefined);
    }

    if upper.starts_with("LOAD DATA") {
        return (QueryType::WRITE, Operation::Load);
    }

    (QueryType::UNKNOWN, Operation::Undefined)
}

/// Skip over comments in front of the first keyword
fn strip_leading_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("/*") {
            match rest.find("*/") {
                Some(end) => sql = &rest[end + 2..],
                None => return "",
            }
        } else if sql.starts_with("--") || sql.starts_with('#') {
            match sql.find('\n') {
                Some(end) => sql = &sql[end + 1..],
                None => return "",
            }
        } else {
            return sql;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> (QueryType, Operation) {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        KeywordClassifier.classify(&payload)
    }

    #[test]
    fn test_reads_and_writes() {
        assert!(classify("SELECT * FROM t").0.is(QueryType::READ));
        assert!(classify("select 1").0.is(QueryType::READ));
        assert!(classify("INSERT INTO t VALUES (1)").0.is(QueryType::WRITE));
        assert!(classify("UPDATE t SET a=1").0.is(QueryType::WRITE));
        assert!(classify("DELETE FROM t").0.is(QueryType::WRITE));
        assert!(classify("SELECT * FROM t FOR UPDATE").0.is(QueryType::WRITE));
    }

    #[test]
    fn test_variable_access() {
        assert!(classify("SELECT @@read_only").0.is(QueryType::SYSVAR_READ));
        assert!(classify("SELECT @@global.sql_mode")
            .0
            .is(QueryType::GSYSVAR_READ));
        assert!(classify("SELECT @total").0.is(QueryType::USERVAR_READ));
        assert!(classify("SET @total = 5").0.is(QueryType::USERVAR_WRITE));
        assert!(classify("SET GLOBAL max_connections = 100")
            .0
            .is(QueryType::GSYSVAR_WRITE));
    }

    #[test]
    fn test_session_writes() {
        assert!(classify("SET NAMES utf8").0.is(QueryType::SESSION_WRITE));
        assert!(classify("USE app").0.is(QueryType::SESSION_WRITE));

        let (qtype, _) = classify("SET autocommit = 0");
        assert!(qtype.is(QueryType::DISABLE_AUTOCOMMIT));
        let (qtype, _) = classify("SET autocommit=1");
        assert!(qtype.is(QueryType::ENABLE_AUTOCOMMIT));
    }

    #[test]
    fn test_transactions() {
        assert!(classify("BEGIN").0.is(QueryType::BEGIN_TRX));
        let (qtype, _) = classify("START TRANSACTION READ ONLY");
        assert!(qtype.is(QueryType::BEGIN_TRX));
        assert!(qtype.is(QueryType::READ));
        assert!(classify("COMMIT").0.is(QueryType::COMMIT));
        assert!(classify("ROLLBACK").0.is(QueryType::ROLLBACK));
    }

    #[test]
    fn test_load_data() {
        let (qtype, op) = classify("LOAD DATA LOCAL INFILE '/tmp/f' INTO TABLE t");
        assert!(qtype.is(QueryType::WRITE));
        assert_eq!(op, Operation::Load);
    }

    #[test]
    fn test_temporary_tables_and_unknown() {
        assert!(classify("CREATE TEMPORARY TABLE tmp (a INT)")
            .0
            .is(QueryType::CREATE_TMP_TABLE));
        // anything unrecognised errs toward the primary
        assert!(classify("FLUSH PRIVILEGES").0.is(QueryType::UNKNOWN));
    }

    #[test]
    fn test_leading_comment_skipped() {
        assert!(classify("/* pick me */ SELECT 1").0.is(QueryType::READ));
        assert!(classify("-- note\nSELECT 1").0.is(QueryType::READ));
    }

    #[test]
    fn test_named_prepare_is_a_session_write() {
        let (qtype, _) = classify("PREPARE stmt FROM 'SELECT ?'");
        assert!(qtype.is(QueryType::SESSION_WRITE));
        assert!(qtype.is(QueryType::PREPARE_NAMED_STMT));
    }

    #[test]
    fn test_prepare_command_flag() {
        let mut payload = vec![Command::StmtPrepare as u8];
        payload.extend_from_slice(b"SELECT ?");
        let (qtype, _) = KeywordClassifier.classify(&payload);
        assert!(qtype.is(QueryType::PREPARE_STMT));
        assert!(qtype.is(QueryType::READ));
    }
}
