use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use tracing::debug;

/// Statement type bitmask
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeMask(u32);

impl TypeMask {
    pub const NONE: TypeMask = TypeMask(0);
    /// Reads data, safe on a replica
    pub const READ: TypeMask = TypeMask(1);
    /// Modifies data or schema
    pub const WRITE: TypeMask = TypeMask(1 << 1);
    /// Changes session state, must reach every connection
    pub const SESSION_WRITE: TypeMask = TypeMask(1 << 2);
    /// Read that depends on primary-only state (LAST_INSERT_ID() and friends)
    pub const MASTER_READ: TypeMask = TypeMask(1 << 3);
    pub const BEGIN_TRX: TypeMask = TypeMask(1 << 4);
    pub const COMMIT: TypeMask = TypeMask(1 << 5);
    pub const ROLLBACK: TypeMask = TypeMask(1 << 6);
    pub const ENABLE_AUTOCOMMIT: TypeMask = TypeMask(1 << 7);
    pub const DISABLE_AUTOCOMMIT: TypeMask = TypeMask(1 << 8);
    /// START TRANSACTION READ ONLY
    pub const READONLY: TypeMask = TypeMask(1 << 9);
    /// START TRANSACTION READ WRITE
    pub const READWRITE: TypeMask = TypeMask(1 << 10);
    pub const USE_DB: TypeMask = TypeMask(1 << 11);
    pub const KILL: TypeMask = TypeMask(1 << 12);
    pub const SHOW_DATABASES: TypeMask = TypeMask(1 << 13);
    /// Several statements in one packet
    pub const MULTI_STMT: TypeMask = TypeMask(1 << 14);
    pub const UNKNOWN: TypeMask = TypeMask(1 << 15);

    pub fn contains(self, other: TypeMask) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn intersects(self, other: TypeMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// A read that any replica may serve
    pub fn is_pure_read(self) -> bool {
        self.contains(Self::READ)
            && !self.intersects(
                Self::WRITE
                    | Self::SESSION_WRITE
                    | Self::MASTER_READ
                    | Self::BEGIN_TRX
                    | Self::COMMIT
                    | Self::ROLLBACK
                    | Self::MULTI_STMT
                    | Self::UNKNOWN,
            )
    }

    pub fn ends_trx(self) -> bool {
        self.intersects(Self::COMMIT | Self::ROLLBACK)
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for TypeMask {
    fn bitor_assign(&mut self, rhs: TypeMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TypeMask, &str); 16] = [
            (TypeMask::READ, "READ"),
            (TypeMask::WRITE, "WRITE"),
            (TypeMask::SESSION_WRITE, "SESSION_WRITE"),
            (TypeMask::MASTER_READ, "MASTER_READ"),
            (TypeMask::BEGIN_TRX, "BEGIN_TRX"),
            (TypeMask::COMMIT, "COMMIT"),
            (TypeMask::ROLLBACK, "ROLLBACK"),
            (TypeMask::ENABLE_AUTOCOMMIT, "ENABLE_AUTOCOMMIT"),
            (TypeMask::DISABLE_AUTOCOMMIT, "DISABLE_AUTOCOMMIT"),
            (TypeMask::READONLY, "READONLY"),
            (TypeMask::READWRITE, "READWRITE"),
            (TypeMask::USE_DB, "USE_DB"),
            (TypeMask::KILL, "KILL"),
            (TypeMask::SHOW_DATABASES, "SHOW_DATABASES"),
            (TypeMask::MULTI_STMT, "MULTI_STMT"),
            (TypeMask::UNKNOWN, "UNKNOWN"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "TypeMask({})", names.join("|"))
    }
}

/// A table reference, optionally qualified with its database
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub database: Option<String>,
    pub table: String,
}

/// Result of classifying one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub mask: TypeMask,
    pub tables: Vec<TableRef>,
    /// Target of USE
    pub database: Option<String>,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            mask: TypeMask::UNKNOWN,
            tables: Vec::new(),
            database: None,
        }
    }

    /// Classification of a non-query command
    pub fn from_mask(mask: TypeMask) -> Self {
        Self {
            mask,
            tables: Vec::new(),
            database: None,
        }
    }
}

/// Functions whose result is only meaningful on the primary
const MASTER_ONLY_FUNCTIONS: &[&str] = &[
    "LAST_INSERT_ID",
    "FOUND_ROWS",
    "ROW_COUNT",
    "GET_LOCK",
    "RELEASE_LOCK",
    "IS_USED_LOCK",
    "IS_FREE_LOCK",
];

const WRITE_STATEMENTS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "REPLACE", "CREATE", "DROP", "ALTER", "TRUNCATE", "RENAME",
    "GRANT", "REVOKE", "LOAD", "CALL", "LOCK", "UNLOCK", "FLUSH", "OPTIMIZE", "ANALYZE", "REPAIR",
    "DO", "HANDLER", "PREPARE", "EXECUTE", "DEALLOCATE", "SAVEPOINT", "RELEASE", "XA", "PURGE",
    "RESET", "INSTALL", "UNINSTALL",
];

/// Token-level statement classifier.
///
/// This is not a SQL parser: it looks at keywords and identifiers only,
/// which is enough to decide where a statement may run.
pub struct Classifier {
    dialect: MySqlDialect,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    /// Classify a statement
    pub fn classify(&self, sql: &str) -> Classification {
        let tokens = match Tokenizer::new(&self.dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, "Failed to tokenize statement");
                return Classification::unknown();
            }
        };

        let statements: Vec<Vec<Token>> = tokens
            .split(|t| matches!(t, Token::SemiColon))
            .map(|stmt| {
                stmt.iter()
                    .filter(|t| !matches!(t, Token::Whitespace(_)))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|stmt| !stmt.is_empty())
            .collect();

        match statements.len() {
            0 => Classification::unknown(),
            1 => classify_tokens(&statements[0]),
            _ => {
                let mut result = Classification::from_mask(TypeMask::MULTI_STMT | TypeMask::WRITE);
                for stmt in &statements {
                    let part = classify_tokens(stmt);
                    result.mask |= part.mask;
                    for table in part.tables {
                        if !result.tables.contains(&table) {
                            result.tables.push(table);
                        }
                    }
                    if part.database.is_some() {
                        result.database = part.database;
                    }
                }
                result
            }
        }
    }
}

/// Uppercased keyword text of an unquoted word
fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(Word {
            value,
            quote_style: None,
            ..
        }) => Some(value.to_ascii_uppercase()),
        _ => None,
    }
}

fn is_kw(token: Option<&Token>, expected: &str) -> bool {
    token
        .and_then(keyword)
        .map(|k| k == expected)
        .unwrap_or(false)
}

fn classify_tokens(tokens: &[Token]) -> Classification {
    // Leading parentheses, as in "(SELECT ...) UNION (SELECT ...)"
    let start = tokens
        .iter()
        .position(|t| !matches!(t, Token::LParen))
        .unwrap_or(tokens.len());
    let tokens = &tokens[start..];

    let Some(first) = tokens.first().and_then(keyword) else {
        return Classification::unknown();
    };

    let mut result = Classification::from_mask(TypeMask::NONE);
    result.mask = match first.as_str() {
        "SELECT" => classify_select(tokens),
        "SHOW" => {
            let next = tokens.get(1).and_then(keyword);
            match next.as_deref() {
                Some("DATABASES") | Some("SCHEMAS") => TypeMask::READ | TypeMask::SHOW_DATABASES,
                _ => TypeMask::READ,
            }
        }
        "EXPLAIN" | "DESCRIBE" | "DESC" | "HELP" => TypeMask::READ,
        "WITH" => {
            if tokens
                .iter()
                .filter_map(keyword)
                .any(|k| matches!(k.as_str(), "INSERT" | "UPDATE" | "DELETE"))
            {
                TypeMask::WRITE
            } else {
                classify_select(tokens)
            }
        }
        "BEGIN" => TypeMask::BEGIN_TRX,
        "START" if is_kw(tokens.get(1), "TRANSACTION") => classify_start_transaction(tokens),
        "COMMIT" => TypeMask::COMMIT,
        "ROLLBACK" if is_kw(tokens.get(1), "TO") => TypeMask::WRITE,
        "ROLLBACK" => TypeMask::ROLLBACK,
        "SET" => classify_set(tokens),
        "USE" => {
            result.database = tokens.get(1).and_then(identifier);
            TypeMask::SESSION_WRITE | TypeMask::USE_DB
        }
        "KILL" => TypeMask::KILL,
        k if WRITE_STATEMENTS.contains(&k) => TypeMask::WRITE,
        _ => TypeMask::UNKNOWN,
    };

    result.tables = extract_tables(tokens);
    result
}

fn classify_select(tokens: &[Token]) -> TypeMask {
    let mut mask = TypeMask::READ;
    let mut prev: Option<String> = None;

    for (i, token) in tokens.iter().enumerate() {
        let Some(kw) = keyword(token) else {
            prev = None;
            continue;
        };
        match kw.as_str() {
            "UPDATE" if prev.as_deref() == Some("FOR") => mask = TypeMask::WRITE,
            "SHARE" if prev.as_deref() == Some("IN") => mask = TypeMask::WRITE,
            "INTO" => mask = TypeMask::WRITE,
            f if MASTER_ONLY_FUNCTIONS.contains(&f) && matches!(tokens.get(i + 1), Some(Token::LParen)) => {
                mask |= TypeMask::MASTER_READ;
            }
            _ => {}
        }
        prev = Some(kw);
    }
    mask
}

fn classify_start_transaction(tokens: &[Token]) -> TypeMask {
    let mut mask = TypeMask::BEGIN_TRX;
    for pair in tokens.windows(2) {
        if is_kw(pair.first(), "READ") {
            if is_kw(pair.get(1), "ONLY") {
                mask |= TypeMask::READONLY;
            } else if is_kw(pair.get(1), "WRITE") {
                mask |= TypeMask::READWRITE;
            }
        }
    }
    mask
}

fn classify_set(tokens: &[Token]) -> TypeMask {
    match tokens.get(1).and_then(keyword).as_deref() {
        Some("GLOBAL") | Some("@@GLOBAL") => return TypeMask::WRITE,
        Some("TRANSACTION") => return TypeMask::SESSION_WRITE,
        _ => {}
    }

    let mut mask = TypeMask::SESSION_WRITE;
    for (i, token) in tokens.iter().enumerate() {
        let Some(kw) = keyword(token) else { continue };
        if kw.trim_start_matches('@') != "AUTOCOMMIT" {
            continue;
        }
        if !matches!(tokens.get(i + 1), Some(Token::Eq)) {
            continue;
        }
        match autocommit_value(tokens.get(i + 2)) {
            Some(true) => mask |= TypeMask::ENABLE_AUTOCOMMIT | TypeMask::COMMIT,
            Some(false) => mask |= TypeMask::DISABLE_AUTOCOMMIT | TypeMask::BEGIN_TRX,
            None => {}
        }
    }
    mask
}

fn autocommit_value(token: Option<&Token>) -> Option<bool> {
    match token? {
        Token::Number(n, _) => match n.as_str() {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        },
        Token::SingleQuotedString(s) => parse_bool_word(&s.to_ascii_uppercase()),
        t => parse_bool_word(&keyword(t)?),
    }
}

fn parse_bool_word(word: &str) -> Option<bool> {
    match word {
        "ON" | "TRUE" => Some(true),
        "OFF" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Words that end a table list or can never name a table
const STOP_WORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "SET", "VALUES", "VALUE", "ON", "USING", "JOIN", "LEFT", "RIGHT",
    "INNER", "OUTER", "CROSS", "NATURAL", "STRAIGHT_JOIN", "GROUP", "ORDER", "LIMIT", "HAVING",
    "UNION", "FOR", "LOCK", "WINDOW", "INTO", "PARTITION", "AS", "IF", "NOT", "EXISTS", "TABLE",
    "DEFAULT", "WITH", "READ", "WRITE", "LOW_PRIORITY", "IGNORE",
];

fn is_stop_word(token: Option<&Token>) -> bool {
    token
        .and_then(keyword)
        .map(|k| STOP_WORDS.contains(&k.as_str()))
        .unwrap_or(false)
}

/// Identifier text of a word, quoted or not, that is not a stop word
fn identifier(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_some() => Some(w.value.clone()),
        Token::Word(w) if !is_stop_word(Some(token)) => Some(w.value.clone()),
        _ => None,
    }
}

/// Read `db.table` or `table` starting at `i`, returning the index after it
fn qualified_name(tokens: &[Token], i: usize) -> Option<(TableRef, usize)> {
    let first = identifier(tokens.get(i)?)?;
    if matches!(tokens.get(i + 1), Some(Token::Period)) {
        let table = tokens.get(i + 2).and_then(|t| match t {
            Token::Word(w) => Some(w.value.clone()),
            _ => None,
        })?;
        return Some((
            TableRef {
                database: Some(first),
                table,
            },
            i + 3,
        ));
    }
    if first.eq_ignore_ascii_case("DUAL") {
        return None;
    }
    Some((
        TableRef {
            database: None,
            table: first,
        },
        i + 1,
    ))
}

fn extract_tables(tokens: &[Token]) -> Vec<TableRef> {
    let mut tables: Vec<TableRef> = Vec::new();
    let mut push = |t: TableRef| {
        if !tables.contains(&t) {
            tables.push(t);
        }
    };

    let first = tokens.first().and_then(keyword);
    let mut i = 0;
    while i < tokens.len() {
        let kw = keyword(&tokens[i]);
        let starts_list = match kw.as_deref() {
            Some("FROM") | Some("JOIN") | Some("INTO") | Some("TABLE") | Some("TABLES") => true,
            Some("UPDATE") if i == 0 => true,
            Some("TRUNCATE") | Some("DESCRIBE") | Some("DESC") if i == 0 => true,
            _ => false,
        };
        if !starts_list {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        // Modifiers between the keyword and the name
        while let Some(k) = tokens.get(j).and_then(keyword) {
            if matches!(k.as_str(), "IF" | "NOT" | "EXISTS" | "LOW_PRIORITY" | "IGNORE" | "TABLE") {
                j += 1;
            } else {
                break;
            }
        }

        // FROM and TABLES take comma separated lists with optional aliases
        let is_list = matches!(kw.as_deref(), Some("FROM") | Some("TABLES"));
        loop {
            let Some((table, next)) = qualified_name(tokens, j) else {
                break;
            };
            push(table);
            j = next;
            if !is_list {
                break;
            }
            // Skip alias: "t AS a" or "t a", and lock modes of LOCK TABLES
            if is_kw(tokens.get(j), "AS") {
                j += 1;
            }
            while matches!(tokens.get(j), Some(Token::Word(_))) && !is_stop_word(tokens.get(j)) {
                j += 1;
            }
            if matches!(tokens.get(j), Some(Token::Comma)) {
                j += 1;
            } else {
                break;
            }
        }

        // "INSERT INTO t SELECT ... FROM u" keeps scanning
        i = j.max(i + 1);
        if first.as_deref() == Some("USE") {
            break;
        }
    }
    tables
}
