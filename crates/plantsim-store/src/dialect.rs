use std::borrow::Cow;

/// SQL dialect the store is talking to. Repos write canonical `?N`
/// placeholders; everything dialect-specific stays behind this type so the
/// branch never leaks into callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    /// Short identifier for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    /// Positional placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Sqlite => format!("?{n}"),
            Self::Postgres => format!("${n}"),
        }
    }

    /// Whether `INSERT ... RETURNING` can be used.
    pub fn supports_returning(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// RETURNING clause for the given column list, or empty when the dialect
    /// requires a follow-up SELECT instead.
    pub fn returning_clause(&self, columns: &str) -> String {
        if self.supports_returning() {
            format!(" RETURNING {columns}")
        } else {
            String::new()
        }
    }

    /// Rewrite canonical `?N` placeholders into this dialect's syntax.
    /// Placeholders inside single-quoted literals are left untouched.
    pub fn rewrite_placeholders<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        if matches!(self, Self::Sqlite) {
            return Cow::Borrowed(sql);
        }

        let mut out = String::with_capacity(sql.len());
        let mut chars = sql.chars().peekable();
        let mut in_literal = false;
        while let Some(c) = chars.next() {
            if c == '\'' {
                in_literal = !in_literal;
                out.push(c);
            } else if c == '?' && !in_literal && chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                out.push('$');
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    out.push(d);
                    chars.next();
                }
            } else {
                out.push(c);
            }
        }
        Cow::Owned(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags() {
        assert_eq!(SqlDialect::Sqlite.tag(), "sqlite");
        assert_eq!(SqlDialect::Postgres.tag(), "postgres");
    }

    #[test]
    fn placeholders() {
        assert_eq!(SqlDialect::Sqlite.placeholder(3), "?3");
        assert_eq!(SqlDialect::Postgres.placeholder(3), "$3");
    }

    #[test]
    fn returning_availability() {
        assert!(!SqlDialect::Sqlite.supports_returning());
        assert!(SqlDialect::Postgres.supports_returning());
        assert_eq!(SqlDialect::Sqlite.returning_clause("id"), "");
        assert_eq!(SqlDialect::Postgres.returning_clause("id"), " RETURNING id");
    }

    #[test]
    fn rewrite_is_identity_for_sqlite() {
        let sql = "SELECT * FROM sessions WHERE id = ?1 AND user_id = ?2";
        assert!(matches!(
            SqlDialect::Sqlite.rewrite_placeholders(sql),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn rewrite_converts_for_postgres() {
        let sql = "INSERT INTO car_events (session_id, car_id) VALUES (?1, ?2)";
        assert_eq!(
            SqlDialect::Postgres.rewrite_placeholders(sql),
            "INSERT INTO car_events (session_id, car_id) VALUES ($1, $2)"
        );
    }

    #[test]
    fn rewrite_handles_double_digit_placeholders() {
        let sql = "VALUES (?9, ?10, ?11)";
        assert_eq!(
            SqlDialect::Postgres.rewrite_placeholders(sql),
            "VALUES ($9, $10, $11)"
        );
    }

    #[test]
    fn rewrite_ignores_question_marks_in_literals() {
        let sql = "SELECT '?1' AS lit, name FROM sessions WHERE id = ?1";
        assert_eq!(
            SqlDialect::Postgres.rewrite_placeholders(sql),
            "SELECT '?1' AS lit, name FROM sessions WHERE id = $1"
        );
    }

    #[test]
    fn rewrite_leaves_bare_question_mark() {
        // A bare `?` (no digit) is not a canonical placeholder
        let sql = "SELECT * FROM t WHERE note = 'why?' AND id = ?1";
        assert_eq!(
            SqlDialect::Postgres.rewrite_placeholders(sql),
            "SELECT * FROM t WHERE note = 'why?' AND id = $1"
        );
    }
}
