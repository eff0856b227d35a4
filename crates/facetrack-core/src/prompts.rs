//! Pose and expression prompts shown during enrollment.

use thiserror::Error;

/// Default prompt order. "center" appears twice; the second pass gives a
/// straight-on sample taken after the user has moved around.
pub const DEFAULT_PROMPTS: [&str; 19] = [
    "center",
    "slightly right",
    "right",
    "slightly left",
    "left",
    "slightly up",
    "up",
    "slightly down",
    "down",
    "right up",
    "right down",
    "left up",
    "left down",
    "center",
    "slight smile",
    "big smile",
    "neutral",
    "slight frown",
    "eyebrows raised",
];

pub fn default_prompts() -> Vec<String> {
    DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("prompt list is empty")]
    Empty,
    #[error("prompt {0} is blank")]
    Blank(usize),
}

/// Trim each prompt and reject empty lists or blank entries.
pub fn normalize_prompts(prompts: Vec<String>) -> Result<Vec<String>, PromptError> {
    if prompts.is_empty() {
        return Err(PromptError::Empty);
    }
    prompts
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let p = p.trim().to_string();
            if p.is_empty() {
                Err(PromptError::Blank(i))
            } else {
                Ok(p)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prompts() {
        let prompts = default_prompts();
        assert_eq!(prompts.len(), 19);
        assert_eq!(prompts.first().map(String::as_str), Some("center"));
        assert_eq!(prompts.last().map(String::as_str), Some("eyebrows raised"));
    }

    #[test]
    fn test_normalize_prompts() {
        let ok = normalize_prompts(vec![" left ".into(), "right".into()]).unwrap();
        assert_eq!(ok, vec!["left", "right"]);
        assert_eq!(normalize_prompts(vec![]), Err(PromptError::Empty));
        assert_eq!(
            normalize_prompts(vec!["up".into(), "  ".into()]),
            Err(PromptError::Blank(1))
        );
    }
}
