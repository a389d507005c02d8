//! SDP sanitizing for the media layer.
//!
//! The media server only negotiates audio, so video sections are dropped from
//! the caller's offer before it is handed over.

/// Remove every `m=video` section from a session description.
///
/// A section runs from its `m=` line up to (not including) the next `m=` line.
/// All other lines, including their original terminators, pass through
/// untouched. Applying it twice is the same as applying it once.
pub fn strip_video(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    let mut in_video = false;

    for line in sdp.split_inclusive('\n') {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
        }
        if !in_video {
            out.push_str(line);
        }
    }

    out
}

/// True if the description carries at least one video section.
pub fn has_video(sdp: &str) -> bool {
    sdp.lines().any(|l| l.starts_with("m=video"))
}
