//! Recognises spoken requests to end the call.

pub const DEFAULT_PHRASES: &[&str] = &[
    "end call",
    "end the call",
    "hang up",
    "goodbye",
    "stop calling",
    "i'm awake",
    "i am awake",
];

/// Phrase matching on whole words, ignoring case and punctuation.
#[derive(Debug, Clone)]
pub struct TerminationPhrases {
    phrases: Vec<Vec<String>>,
}

impl TerminationPhrases {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| tokenize(p.as_ref()))
                .filter(|tokens| !tokens.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, transcript: &str) -> bool {
        let words = tokenize(transcript);
        self.phrases.iter().any(|phrase| {
            words
                .windows(phrase.len())
                .any(|window| window == phrase.as_slice())
        })
    }
}

impl Default for TerminationPhrases {
    fn default() -> Self {
        Self::new(DEFAULT_PHRASES)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_whole_phrases() {
        let phrases = TerminationPhrases::default();
        assert!(phrases.matches("OK, hang up now."));
        assert!(phrases.matches("Goodbye!"));
        assert!(phrases.matches("I\u{2019}m awake, I promise"));
        assert!(phrases.matches("please   END   the call"));
    }

    #[test]
    fn ignores_partial_words() {
        let phrases = TerminationPhrases::default();
        assert!(!phrases.matches("I'm hungry"));
        assert!(!phrases.matches("the weekend call was fun"));
        assert!(!phrases.matches("goodbyes are hard"));
        assert!(!phrases.matches(""));
    }

    #[test]
    fn custom_vocabulary() {
        let phrases = TerminationPhrases::new(["I'm up", "  "]);
        assert!(phrases.matches("okay okay I'm up"));
        assert!(!phrases.matches("hang up"));
    }
}
