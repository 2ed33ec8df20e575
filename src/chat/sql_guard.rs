// Cleanup and allow-listing of model-generated SQL.

/// Pulls the statement out of a model reply: drops code fences, a leading `sql` tag and
/// trailing semicolons.
pub fn extract_sql(raw: &str) -> String {
    let mut text = raw.trim();

    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        text = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
    }
    let text = text.replace('`', "");
    let mut text = text.trim();
    if text.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("sql")) {
        let rest = &text[3..];
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            text = rest;
        }
    }

    text.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

/// Accepts a single statement beginning with `SELECT` or `WITH`. The database layer
/// additionally confirms the prepared statement is read-only.
pub fn check_allowed(sql: &str) -> Result<(), String> {
    let first_word: String = sql
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    if first_word != "SELECT" && first_word != "WITH" {
        return Err(format!(
            "only SELECT or WITH queries are allowed, got {:?}",
            if first_word.is_empty() { sql.trim() } else { first_word.as_str() }
        ));
    }
    if has_statement_separator(sql) {
        return Err("multiple statements are not allowed".into());
    }
    Ok(())
}

/// Whether a `;` occurs outside string literals, quoted identifiers and comments,
/// ignoring a trailing one.
fn has_statement_separator(sql: &str) -> bool {
    let body = sql.trim_end().trim_end_matches(';');
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            quote @ ('\'' | '"') => {
                i += 1;
                while i < chars.len() {
                    if chars[i] == quote {
                        // doubled quote escapes itself
                        if chars.get(i + 1) == Some(&quote) {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                    i += 1;
                }
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 1;
            }
            ';' => return true,
            _ => {}
        }
        i += 1;
    }
    false
}
