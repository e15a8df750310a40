use anyhow::Context;
use std::io::{IsTerminal, Read};

const EMPTY_PROMPT: &str = "The user did not provide a prompt.";

/// Build the prompt sent to the provider from positional words and piped stdin.
pub fn compose(words: &[String], piped: Option<&str>) -> String {
    let mut prompt = words.join(" ");
    if prompt.trim().is_empty() {
        prompt = EMPTY_PROMPT.to_string();
    }

    if let Some(input) = piped.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\nUser also attached via pipe the following input:\n");
        prompt.push_str(input);
    }
    prompt
}

/// Read stdin when something is piped in; a terminal yields None.
pub fn read_piped_stdin() -> anyhow::Result<Option<String>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut buf = String::new();
    stdin
        .read_to_string(&mut buf)
        .context("failed to read piped input")?;
    Ok(Some(buf))
}
