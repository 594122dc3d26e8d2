//! Name normalization for catalog tables and columns.
//!
//! Catalog identifiers are lower case and limited to `a-z`, `0-9` and `_`. CamelCase words are
//! split with underscores and every run of other characters collapses into a single `_`.

/// Converts an arbitrary table name into a catalog-compatible one.
///
/// ```
/// # use lakeshift_table::sanitize_table_name;
/// assert_eq!(sanitize_table_name("MyNew Table!"), "my_new_table_");
/// ```
pub fn sanitize_table_name(name: &str) -> String {
    sanitize_name(name)
}

/// Converts an arbitrary column name into a catalog-compatible one.
///
/// ```
/// # use lakeshift_table::sanitize_column_name;
/// assert_eq!(sanitize_column_name("orderID"), "order_id");
/// ```
pub fn sanitize_column_name(name: &str) -> String {
    sanitize_name(name)
}

fn sanitize_name(name: &str) -> String {
    let snake = camel_to_snake(name);
    let mut out = String::with_capacity(snake.len());
    let mut in_separator_run = false;
    for c in snake.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            in_separator_run = false;
        } else if !in_separator_run {
            out.push('_');
            in_separator_run = true;
        }
    }
    out
}

fn camel_to_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let starts_word = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower);
            if starts_word && !out.ends_with('_') {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_column_name_splits_camel_case() {
        assert_eq!(sanitize_column_name("camelCase"), "camel_case");
        assert_eq!(sanitize_column_name("HTTPResponseCode"), "http_response_code");
        assert_eq!(sanitize_column_name("already_snake"), "already_snake");
    }

    #[test]
    fn sanitize_table_name_collapses_invalid_characters() {
        assert_eq!(sanitize_table_name("sales data-2020"), "sales_data_2020");
        assert_eq!(sanitize_table_name("a   b"), "a_b");
        assert_eq!(sanitize_table_name("Über"), "_ber");
    }
}
