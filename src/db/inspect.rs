//! Lexical inspection of SQL text.
//!
//! Counts positional placeholders and decides whether a statement returns
//! rows. Uses the [sqlparser](https://docs.rs/sqlparser/) tokenizer so that
//! placeholders inside string literals, quoted identifiers and comments are
//! never counted.

use crate::error::{DbError, DbResult, QueryErrorKind};
use crate::models::{Statement, StatementKind};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};

fn tokenize(sql: &str) -> DbResult<Vec<Token>> {
    Tokenizer::new(&GenericDialect {}, sql)
        .tokenize()
        .map_err(|e| {
            DbError::query(
                QueryErrorKind::SyntaxInvalid,
                format!("Failed to tokenize SQL statement: {}", e),
                None,
            )
        })
}

/// Number of parameters the statement expects.
///
/// Anonymous `?` placeholders count one each. Numbered placeholders (`$N`,
/// `?N`) count as the highest index used, since one index may appear
/// several times.
pub fn placeholder_count(sql: &str) -> DbResult<usize> {
    let mut anonymous = 0usize;
    let mut highest = 0usize;

    for token in tokenize(sql)? {
        let Token::Placeholder(p) = token else {
            continue;
        };
        let digits = p.trim_start_matches(['$', '?']);
        if digits.is_empty() {
            anonymous += 1;
        } else if let Ok(n) = digits.parse::<usize>() {
            highest = highest.max(n);
        }
    }

    Ok(anonymous + highest)
}

/// Infer whether a statement produces rows.
///
/// Queries (`SELECT`, `WITH`, `VALUES`, `SHOW`, `EXPLAIN`, `PRAGMA`,
/// `DESCRIBE`, `TABLE`) and any statement with a `RETURNING` clause are
/// reads. A `WITH` whose body is a DML statement without `RETURNING` is a
/// write. Everything else, including SQL that fails to tokenize, is a write.
pub fn statement_kind(sql: &str) -> StatementKind {
    let Some(keywords) = keywords(sql) else {
        return StatementKind::Write;
    };

    if keywords.contains(&Keyword::RETURNING) {
        return StatementKind::Read;
    }

    match keywords.first() {
        Some(Keyword::WITH) => {
            if has_dml(&keywords) {
                StatementKind::Write
            } else {
                StatementKind::Read
            }
        }
        Some(
            Keyword::SELECT
            | Keyword::VALUES
            | Keyword::SHOW
            | Keyword::EXPLAIN
            | Keyword::PRAGMA
            | Keyword::DESCRIBE
            | Keyword::TABLE,
        ) => StatementKind::Read,
        _ => StatementKind::Write,
    }
}

/// True when the statement returns rows without modifying anything, so it
/// can be re-run after a transient failure. `INSERT ... RETURNING` is a read
/// by [`statement_kind`] but not read-only.
pub fn is_read_only(sql: &str) -> bool {
    match keywords(sql) {
        Some(keywords) => {
            statement_kind(sql) == StatementKind::Read
                && !keywords.contains(&Keyword::RETURNING)
                && !has_dml(&keywords)
        }
        None => false,
    }
}

fn keywords(sql: &str) -> Option<Vec<Keyword>> {
    let tokens = tokenize(sql).ok()?;
    Some(
        tokens
            .iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w.keyword),
                _ => None,
            })
            .collect(),
    )
}

fn has_dml(keywords: &[Keyword]) -> bool {
    keywords.iter().any(|k| {
        matches!(
            k,
            Keyword::INSERT | Keyword::UPDATE | Keyword::DELETE | Keyword::MERGE
        )
    })
}

/// Fail with `ParameterMismatch` unless the statement's parameter count
/// matches its placeholders.
pub fn check_parameters(statement: &Statement) -> DbResult<()> {
    let expected = placeholder_count(&statement.sql)?;
    let supplied = statement.params.len();
    if expected != supplied {
        return Err(DbError::parameter_mismatch(expected, supplied));
    }
    Ok(())
}
