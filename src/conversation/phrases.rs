//! Fixed lines the engine speaks, and caller-intent checks.

use rand::seq::SliceRandom;

use crate::calling::routing::DeviceProfile;

pub const DIDNT_HEAR: &str = "Sorry, I didn't hear anything. Go ahead whenever you're ready.";
pub const CLARIFY: &str = "Sorry, I didn't catch that. Could you say it again?";
pub const FAREWELL: &str = "Goodbye! Thanks for calling.";
pub const MAX_TURNS_LINE: &str =
    "We've been talking for a while, so I'm going to wrap up this call. Goodbye!";
pub const APOLOGY: &str = "Sorry, something went wrong on my end. Please try calling again later.";

const THINKING_PHRASES: &[&str] = &[
    "Let me think about that.",
    "One moment.",
    "Let me check.",
    "Give me a second.",
    "Working on it.",
    "Hmm, let me see.",
];

const GOODBYE_PHRASES: &[&str] = &[
    "goodbye",
    "good bye",
    "bye",
    "bye bye",
    "that's all",
    "that is all",
    "hang up",
    "end call",
    "end the call",
    "i'm done",
    "talk to you later",
    "see you later",
];

pub fn greeting(device: &DeviceProfile, is_default: bool) -> String {
    if is_default {
        "Hello! How can I help you today?".to_string()
    } else {
        format!("Hi, this is {}. How can I help you today?", device.name)
    }
}

/// Uniform pick from the filler list.
pub fn thinking_phrase() -> &'static str {
    THINKING_PHRASES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("One moment.")
}

#[cfg(test)]
pub fn is_thinking_phrase(text: &str) -> bool {
    THINKING_PHRASES.contains(&text)
}

/// Too little text to act on.
pub fn needs_clarification(transcript: &str) -> bool {
    transcript.trim().chars().count() < 2
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// The caller wants to end the call.
///
/// A phrase matches only as whole words: "ok bye" ends the call, "subvert"
/// and "byebye" do not.
pub fn is_goodbye(transcript: &str) -> bool {
    let words = tokens(transcript);
    if words.is_empty() {
        return false;
    }
    GOODBYE_PHRASES.iter().any(|phrase| {
        let phrase = tokens(phrase);
        words.windows(phrase.len()).any(|w| w == phrase.as_slice())
    })
}
