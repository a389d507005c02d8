//! Composite prompt for a voice turn.

/// Format contract appended to every query. The conversation engine parses
/// the two tagged lines back out of the answer.
pub const VOICE_FORMAT_INSTRUCTIONS: &str = "\
[VOICE CALL]
You are talking to someone on a live phone call. Your reply will be read aloud
by a text-to-speech engine, so keep it conversational and free of markdown,
lists, code, and URLs.

End your reply with exactly these two lines:
🗣️ VOICE_RESPONSE: <your spoken answer, at most 40 words>
🎯 COMPLETED: <what you did, at most 12 words>";

/// Build the prompt: optional persona fragment, the voice format block, then
/// what the caller said.
pub fn build(transcript: &str, device_prompt: Option<&str>) -> String {
    let mut prompt = String::new();

    if let Some(fragment) = device_prompt.map(str::trim).filter(|f| !f.is_empty()) {
        prompt.push_str(fragment);
        prompt.push_str("\n\n");
    }

    prompt.push_str(VOICE_FORMAT_INSTRUCTIONS);
    prompt.push_str("\n\nCaller said: ");
    prompt.push_str(transcript.trim());
    prompt
}
