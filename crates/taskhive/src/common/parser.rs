use anyhow::anyhow;
use chumsky::Parser;
use chumsky::error::{Simple, SimpleReason};
use chumsky::primitive::{end, filter, just};

pub type ParseError = Simple<char>;

pub trait CharParser<T>: Parser<char, T, Error = ParseError> + Sized {
    fn parse_text(&self, input: &str) -> anyhow::Result<T> {
        self.parse(input)
            .map_err(|errors| anyhow!("{}", format_parse_error(input, errors)))
    }
}
impl<T, P> CharParser<T> for P where P: Parser<char, T, Error = ParseError> {}

/// Renders the first parse error together with the input and a marker under the
/// offending part.
pub fn format_parse_error(input: &str, errors: Vec<ParseError>) -> String {
    let Some(error) = errors.into_iter().next() else {
        return format!("Cannot parse `{input}`");
    };
    let expected = if error.expected().len() == 0 {
        "something else".to_string()
    } else {
        let mut expected: Vec<String> = error
            .expected()
            .map(|expected| match expected {
                Some(c) => c.to_string(),
                None => "<end of input>".to_string(),
            })
            .collect();
        expected.sort_unstable();
        expected.join(" or ")
    };
    let mut output = format!(
        "{} found{}, expected {expected}",
        if error.found().is_some() {
            "Unexpected token"
        } else {
            "Unexpected end of input"
        },
        error
            .label()
            .map(|label| format!(" while attempting to parse {label}"))
            .unwrap_or_default(),
    );
    if input.is_empty() {
        output.push_str(" (the input was empty)");
        return output;
    }

    let span = error.span();
    let note = match error.reason() {
        SimpleReason::Custom(message) => message.clone(),
        _ => match error.found() {
            Some(c) => format!("Unexpected token `{c}`"),
            None => "Unexpected end of input".to_string(),
        },
    };
    let spaces = " ".repeat(2 + span.start);
    output.push_str(&format!("\n  {input}\n{spaces}|\n{spaces}--- {note}"));
    output
}

fn parse_integer_string() -> impl CharParser<String> {
    filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .collect::<String>()
        .labelled("number")
}

pub fn parse_u32() -> impl CharParser<u32> {
    parse_integer_string().try_map(|number, span| {
        number
            .parse::<u32>()
            .map_err(|_| ParseError::custom(span, "Cannot parse as 4-byte unsigned integer"))
    })
}

pub fn parse_u64() -> impl CharParser<u64> {
    parse_integer_string().try_map(|number, span| {
        number
            .parse::<u64>()
            .map_err(|_| ParseError::custom(span, "Cannot parse as 8-byte unsigned integer"))
    })
}

/// Matches the given keyword exactly
pub fn parse_exact_string(keyword: &'static str) -> impl CharParser<()> + Clone {
    just(keyword).ignored().labelled(keyword)
}

/// Fails when any input is left after the wrapped parser
pub fn all_consuming<T>(parser: impl CharParser<T>) -> impl CharParser<T> {
    parser.then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32().parse_text("0").unwrap(), 0);
        assert_eq!(parse_u32().parse_text("1019").unwrap(), 1019);
        assert_eq!(
            all_consuming(parse_u32()).parse_text("4294967295").unwrap(),
            u32::MAX
        );
    }

    #[test]
    fn test_parse_u32_overflow() {
        let error = all_consuming(parse_u32())
            .parse_text("4294967296")
            .unwrap_err()
            .to_string();
        assert!(error.contains("Cannot parse as 4-byte unsigned integer"), "{error}");
    }

    #[test]
    fn test_parse_u32_invalid() {
        let error = parse_u32().parse_text("x").unwrap_err().to_string();
        assert!(error.starts_with("Unexpected token found while attempting to parse number"));
        assert!(error.contains("--- Unexpected token `x`"), "{error}");
    }

    #[test]
    fn test_parse_empty_input() {
        let error = parse_u64().parse_text("").unwrap_err().to_string();
        assert!(error.contains("(the input was empty)"), "{error}");
    }

    #[test]
    fn test_trailing_input() {
        assert!(all_consuming(parse_u64()).parse_text("12x").is_err());
        assert_eq!(parse_u64().parse_text("12x").unwrap(), 12);
    }
}
