//! Reducer for the LLM CLI's line-delimited JSON output.
//!
//! Each line is one record. Assistant records append their text blocks to a
//! running buffer; a terminal `result` record replaces the buffer and carries
//! the session token and cost. Lines that do not parse are skipped.

use serde::Deserialize;

/// Returned when the subprocess produced nothing usable at all.
pub const EMPTY_RESPONSE: &str = "I'm not sure how to respond to that.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRecord {
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Accumulated view of one invocation's output.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamSummary {
    pub text: String,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub records: usize,
    pub skipped: usize,
}

impl StreamSummary {
    pub fn apply(&mut self, record: StreamRecord) {
        self.records += 1;
        match record {
            StreamRecord::Assistant { message } => {
                for block in message.content {
                    if let ContentBlock::Text { text } = block {
                        self.text.push_str(&text);
                    }
                }
            }
            StreamRecord::Result {
                result,
                session_id,
                total_cost_usd,
            } => {
                // The final result is authoritative over streamed fragments.
                if let Some(result) = result.filter(|r| !r.is_empty()) {
                    self.text = result;
                }
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                if total_cost_usd.is_some() {
                    self.cost_usd = total_cost_usd;
                }
            }
            StreamRecord::Other => {}
        }
    }
}

/// Fold every line of `raw` into a summary.
pub fn reduce(raw: &str) -> StreamSummary {
    let mut summary = StreamSummary::default();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<StreamRecord>(line) {
            Ok(record) => summary.apply(record),
            Err(_) => summary.skipped += 1,
        }
    }
    summary
}

/// Final response text. Never empty.
pub fn response_text(summary: &StreamSummary, raw: &str) -> String {
    let extracted = summary.text.trim();
    if !extracted.is_empty() {
        return extracted.to_string();
    }
    let raw = raw.trim();
    if !raw.is_empty() {
        return raw.to_string();
    }
    EMPTY_RESPONSE.to_string()
}
