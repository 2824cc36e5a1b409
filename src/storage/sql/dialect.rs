//! SQL dialect translation.
//!
//! All queries in this backend are written once, in Postgres dialect. A
//! [`Flavor`] describes how to rewrite them for another database: a list of
//! declarative pattern -> replacement pairs plus a bind-placeholder style.
//! Adding a rewrite means adding a table entry, not code.

use regex::Regex;

/// How the flavor spells bind placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `$1`, `$2`, ... (Postgres; queries are already in this form).
    Dollar,
    /// `?1`, `?2`, ... (SQLite).
    QuestionNumbered,
    /// Bare `?` in argument order (MySQL).
    Question,
}

/// A target SQL dialect.
pub struct Flavor {
    pub name: &'static str,
    /// Regex pattern -> replacement, applied in order.
    pub rewrites: &'static [(&'static str, &'static str)],
    pub placeholder: Placeholder,
}

/// Timestamps are stored as RFC 3339 text so every flavor round-trips
/// chrono values losslessly; `timestamptz` columns rewrite to `text`.
pub const SQLITE: Flavor = Flavor {
    name: "sqlite3",
    rewrites: &[
        (r"\bbytea\b", "blob"),
        (r"\bboolean\b", "integer"),
        (r"\btimestamptz\b", "text"),
        (r"\bbigint\b", "integer"),
        (r"\bnow\(\)", "datetime('now')"),
    ],
    placeholder: Placeholder::QuestionNumbered,
};

pub const MYSQL: Flavor = Flavor {
    name: "mysql",
    rewrites: &[
        (r"\bbytea\b", "blob"),
        (r"\btimestamptz\b", "text"),
        (r"\bnow\(\)", "now()"),
        // Postgres keyword quoting -> backticks.
        (r#"""#, "`"),
    ],
    placeholder: Placeholder::Question,
};

/// Compiled form of a [`Flavor`], built once at backend open.
pub struct Translator {
    rewrites: Vec<(Regex, &'static str)>,
    placeholder: Placeholder,
    bind: Regex,
}

impl Translator {
    pub fn new(flavor: &Flavor) -> Self {
        let rewrites = flavor
            .rewrites
            .iter()
            .map(|(pattern, replacement)| {
                // Patterns are compile-time constants; a bad one is a
                // programming error caught by the tests below.
                (Regex::new(pattern).unwrap(), *replacement)
            })
            .collect();
        Self {
            rewrites,
            placeholder: flavor.placeholder,
            bind: Regex::new(r"\$(\d+)").unwrap(),
        }
    }

    /// Translates a Postgres-dialect query into this flavor.
    pub fn translate(&self, query: &str) -> String {
        let mut out = query.to_string();
        for (regex, replacement) in &self.rewrites {
            out = regex.replace_all(&out, *replacement).into_owned();
        }
        match self.placeholder {
            Placeholder::Dollar => out,
            Placeholder::QuestionNumbered => self.bind.replace_all(&out, "?$1").into_owned(),
            Placeholder::Question => self.bind.replace_all(&out, "?").into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_placeholders_and_types() {
        let t = Translator::new(&SQLITE);
        assert_eq!(
            t.translate("select id from client where id = $1 and public = $2"),
            "select id from client where id = ?1 and public = ?2"
        );
        assert_eq!(
            t.translate("create table t (a bytea, b boolean, c timestamptz)"),
            "create table t (a blob, b integer, c text)"
        );
    }

    #[test]
    fn sqlite_rewrites_respect_word_boundaries() {
        let t = Translator::new(&SQLITE);
        // Column names containing a type name as a substring are left alone.
        assert_eq!(
            t.translate("select bytea_count from t"),
            "select bytea_count from t"
        );
    }

    #[test]
    fn mysql_placeholders_lose_numbering() {
        let t = Translator::new(&MYSQL);
        assert_eq!(
            t.translate("update keys set next_rotation = $1 where id = $2"),
            "update keys set next_rotation = ? where id = ?"
        );
    }

    #[test]
    fn mysql_quoting_becomes_backticks() {
        let t = Translator::new(&MYSQL);
        assert_eq!(
            t.translate(r#"select "type" from connector"#),
            "select `type` from connector"
        );
    }

    #[test]
    fn double_digit_placeholders() {
        let t = Translator::new(&SQLITE);
        assert_eq!(t.translate("values ($9, $10, $11)"), "values (?9, ?10, ?11)");
    }
}
