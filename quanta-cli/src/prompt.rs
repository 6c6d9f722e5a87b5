use anyhow::Result;
use quanta_core::Decision;
use std::io::{self, Write};

pub fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush().ok();
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s.trim().to_string())
}

pub fn confirm(label: &str) -> Result<bool> {
    let answer = prompt(&format!("{label} [y/N]"))?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Parse an answer to "quantum used up": `e [minutes]`, `r` or `c`.
pub fn parse_exhaustion_answer(answer: &str, default_extend: u32) -> Option<Decision> {
    let mut parts = answer.split_whitespace();
    let verb = parts.next()?.to_ascii_lowercase();
    match verb.as_str() {
        "e" | "extend" => {
            let minutes = match parts.next() {
                Some(m) => m.parse().ok()?,
                None => default_extend,
            };
            Some(Decision::Extend { minutes })
        }
        "r" | "requeue" => Some(Decision::Requeue),
        "c" | "complete" | "done" => Some(Decision::Complete),
        _ => None,
    }
}
