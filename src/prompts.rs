//! Prompts for VLM-based table extraction.
//!
//! The parser in [`crate::pipeline::parse`] depends on the output shape
//! requested here (one row per line, cells separated by the delimiter, no
//! prose), so the two must change together.
//!
//! Callers can override the default via
//! [`crate::config::ExtractionConfig::prompt`].

/// Default prompt sent with every chunk image.
///
/// Uses `|` as the delimiter; see [`table_prompt`] for other delimiters.
pub const DEFAULT_TABLE_PROMPT: &str = r#"Extract the table shown in this image.

Follow these rules precisely:

1. Return every row you can see, including the heading row, one row per line.
2. Separate cells with the pipe character |.
3. Keep cell text exactly as printed; leave a cell empty when it is blank.
4. Do not output separator lines made of dashes (such as -----).
5. Do not add commentary, explanations or code fences; output only the table data."#;

/// Build the prompt for an arbitrary cell delimiter.
pub fn table_prompt(delimiter: char) -> String {
    if delimiter == '|' {
        DEFAULT_TABLE_PROMPT.to_string()
    } else {
        DEFAULT_TABLE_PROMPT.replace("the pipe character |", &format!("the character {delimiter}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_mentions_pipe() {
        assert!(table_prompt('|').contains("the pipe character |"));
    }

    #[test]
    fn custom_delimiter_is_substituted() {
        let p = table_prompt(';');
        assert!(p.contains("the character ;"));
        assert!(!p.contains("pipe character"));
    }
}
