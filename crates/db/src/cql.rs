//! Quoting for names and literals embedded in generated CQL.

/// Quote an identifier so it is taken verbatim (case preserved), doubling any
/// embedded double quote.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling any embedded single quote.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_identifier("example_role"), "\"example_role\"");
        assert_eq!(quote_identifier("MixedCase"), "\"MixedCase\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_identifier(""), "\"\"");
    }

    #[test]
    fn literals_are_single_quoted() {
        assert_eq!(quote_literal("data/ks"), "'data/ks'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
