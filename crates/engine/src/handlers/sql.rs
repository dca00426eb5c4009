//! SQL extension handler
//!
//! Splits a migration file into statements and executes them one by one.
//! Lexing is done by the `sqlparser` tokenizer for the driver's dialect; the
//! statement text handed to the driver is cut from the file as written.

use sqlparser::dialect::{Dialect as SqlDialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::tokenizer::{Location, Token, Tokenizer, Whitespace};

use strata_core::{MigrationError, MigrationResult};

use crate::definitions::Migration;
use crate::drivers::{Dialect, Driver};

fn tokenizer_dialect(dialect: Dialect) -> Box<dyn SqlDialect> {
    match dialect {
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
        Dialect::Generic => Box::new(GenericDialect {}),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece {
    Space,
    LineComment,
    Semicolon,
    Code,
}

/// A token located by byte range in the lexed text
#[derive(Debug, Clone, Copy)]
struct Lexeme {
    offset: usize,
    end: usize,
    piece: Piece,
}

/// Maps tokenizer locations (1-based line, 1-based char column) to byte offsets
struct Locator<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> Locator<'a> {
    fn new(text: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { text, line_starts }
    }

    fn offset(&self, location: Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&start) = self.line_starts.get(line) else {
            return self.text.len();
        };
        self.text[start..]
            .char_indices()
            .nth((location.column as usize).saturating_sub(1))
            .map(|(i, _)| start + i)
            .unwrap_or(self.text.len())
    }
}

/// MySQL only treats `--` as a comment when whitespace or a control
/// character follows it
fn opens_mysql_comment(rest: &str) -> bool {
    rest.chars().next().map_or(true, |c| c.is_whitespace() || c.is_control())
}

fn lex(text: &str, dialect: Dialect) -> Result<Vec<Lexeme>, String> {
    let sql_dialect = tokenizer_dialect(dialect);
    let mut lexemes = Vec::new();
    let mut from = 0;

    'tokenize: while from < text.len() {
        let rest = &text[from..];
        let tokens = Tokenizer::new(&*sql_dialect, rest)
            .tokenize_with_location()
            .map_err(|e| e.to_string())?;
        let locator = Locator::new(rest);
        let offsets: Vec<usize> = tokens.iter().map(|t| locator.offset(t.location)).collect();

        for (i, token) in tokens.iter().enumerate() {
            let offset = from + offsets[i];
            let end = from + offsets.get(i + 1).copied().unwrap_or(rest.len());
            let piece = match &token.token {
                Token::EOF => continue,
                Token::SemiColon => Piece::Semicolon,
                Token::Whitespace(Whitespace::SingleLineComment { comment, prefix }) => {
                    if dialect == Dialect::MySql && prefix == "--" && !opens_mysql_comment(comment) {
                        // `5--3`: two minus signs, lex again right after them
                        lexemes.push(Lexeme {
                            offset,
                            end: offset + 2,
                            piece: Piece::Code,
                        });
                        from = offset + 2;
                        continue 'tokenize;
                    }
                    Piece::LineComment
                }
                // Executable comments and optimizer hints
                Token::Whitespace(Whitespace::MultiLineComment(body))
                    if dialect == Dialect::MySql && (body.starts_with('!') || body.starts_with('+')) =>
                {
                    Piece::Code
                }
                Token::Whitespace(_) => Piece::Space,
                _ => Piece::Code,
            };
            lexemes.push(Lexeme { offset, end, piece });
        }
        break;
    }

    Ok(lexemes)
}

fn has_code(lexemes: &[Lexeme]) -> bool {
    lexemes.iter().any(|l| l.piece != Piece::Space && l.piece != Piece::LineComment)
}

/// Text split by `DELIMITER` lines, each part with its statement delimiter
struct Segment<'a> {
    delimiter: &'a str,
    start: usize,
    end: usize,
}

/// Whether `text` ends between statements, so that a `DELIMITER` line
/// following it is a directive and not part of a statement
fn between_statements(text: &str, delimiter: &str, dialect: Dialect) -> bool {
    if delimiter != ";" {
        let text = text.trim_end();
        return text.is_empty() || text.ends_with(delimiter);
    }
    match lex(text, dialect) {
        Ok(lexemes) => lexemes
            .iter()
            .rev()
            .find(|l| matches!(l.piece, Piece::Code | Piece::Semicolon))
            .map_or(true, |l| l.piece == Piece::Semicolon),
        Err(_) => false,
    }
}

fn delimiter_segments(sql: &str, dialect: Dialect) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut delimiter = ";";
    let mut start = 0;
    let mut offset = 0;

    for line in sql.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let trimmed = line.trim();
        let (keyword, value) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
        if !keyword.eq_ignore_ascii_case("delimiter")
            || !between_statements(&sql[start..line_start], delimiter, dialect)
        {
            continue;
        }
        if value.trim().is_empty() {
            return Err("DELIMITER directive without a delimiter".to_string());
        }

        segments.push(Segment {
            delimiter,
            start,
            end: line_start,
        });
        delimiter = value.trim();
        start = offset;
    }

    segments.push(Segment {
        delimiter,
        start,
        end: sql.len(),
    });
    Ok(segments)
}

fn split_on_semicolons(text: &str, dialect: Dialect, statements: &mut Vec<String>) -> Result<(), String> {
    let mut start = 0;
    let mut has_content = false;

    for lexeme in lex(text, dialect)? {
        match lexeme.piece {
            Piece::Semicolon => {
                if has_content {
                    statements.push(text[start..lexeme.offset].trim().to_string());
                }
                start = lexeme.end;
                has_content = false;
            }
            Piece::Code => has_content = true,
            Piece::Space | Piece::LineComment => {}
        }
    }

    if has_content {
        statements.push(text[start..].trim().to_string());
    }
    Ok(())
}

/// A custom delimiter ends a statement when the text before it lexes
/// cleanly and does not end inside a line comment
fn split_on_delimiter(
    text: &str,
    delimiter: &str,
    dialect: Dialect,
    statements: &mut Vec<String>,
) -> Result<(), String> {
    let step = delimiter.chars().next().map_or(1, char::len_utf8);
    let mut start = 0;
    let mut search = 0;

    while let Some(found) = text[search..].find(delimiter) {
        let at = search + found;
        let candidate = &text[start..at];
        match lex(candidate, dialect) {
            Ok(lexemes) if !ends_in_line_comment(candidate, &lexemes) => {
                if has_code(&lexemes) {
                    statements.push(candidate.trim().to_string());
                }
                start = at + delimiter.len();
                search = start;
            }
            _ => search = at + step,
        }
    }

    let rest = &text[start..];
    if has_code(&lex(rest, dialect)?) {
        statements.push(rest.trim().to_string());
    }
    Ok(())
}

fn ends_in_line_comment(text: &str, lexemes: &[Lexeme]) -> bool {
    lexemes.last().map_or(false, |l| {
        l.piece == Piece::LineComment && !text[l.offset..l.end].ends_with('\n')
    })
}

/// Split SQL into statements on `;` (or the delimiter set by a `DELIMITER`
/// line), ignoring delimiters inside comments, quoted strings and identifiers.
/// Statements that hold nothing but comments and whitespace are dropped.
pub fn split_statements(sql: &str, dialect: Dialect) -> Result<Vec<String>, String> {
    let mut statements = Vec::new();
    for segment in delimiter_segments(sql, dialect)? {
        let text = &sql[segment.start..segment.end];
        if segment.delimiter == ";" {
            split_on_semicolons(text, dialect, &mut statements)?;
        } else {
            split_on_delimiter(text, segment.delimiter, dialect, &mut statements)?;
        }
    }
    Ok(statements)
}

/// Executes `.sql` migrations statement by statement
#[derive(Debug, Clone, Default)]
pub struct SqlHandler;

impl SqlHandler {
    pub fn new() -> Self {
        Self
    }

    /// Run every statement of the file; the first failing statement aborts
    /// the rest. Returns the number of statements executed.
    pub async fn handle(&self, migration: &Migration, driver: &mut dyn Driver) -> MigrationResult<usize> {
        let content = tokio::fs::read_to_string(&migration.path).await.map_err(|e| {
            MigrationError::handler(&migration.group, &migration.filename, None, e.to_string())
        })?;

        let statements = split_statements(&content, driver.dialect())
            .map_err(|message| {
                MigrationError::handler(&migration.group, &migration.filename, None, message)
            })?;

        for (index, statement) in statements.iter().enumerate() {
            tracing::debug!(
                group = %migration.group,
                file = %migration.filename,
                statement = index + 1,
                "Executing statement"
            );
            driver.execute(statement).await.map_err(|e| {
                let message = match e {
                    MigrationError::Driver { message } => message,
                    other => other.to_string(),
                };
                MigrationError::handler(
                    &migration.group,
                    &migration.filename,
                    Some(index + 1),
                    message,
                )
            })?;
        }

        Ok(statements.len())
    }
}
