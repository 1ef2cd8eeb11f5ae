//! Reply shape parsing
//!
//! The endpoint may return reasoning inline (`<think>`/`<thinking>` tags),
//! in a separate field, or not at all. Every reply maps onto exactly one
//! [`ReplyShape`]; nothing here fails.

use geoforge_common::llm::Completion;
use regex_lite::Regex;
use std::sync::OnceLock;

const TAGS: [(&str, &str); 2] = [("<thinking>", "</thinking>"), ("<think>", "</think>")];

/// Parsed reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyShape {
    /// Closed reasoning section plus a non-empty answer
    Full {
        thinking: String,
        answer: String,
        citations: Vec<usize>,
    },
    /// Answer without reasoning
    AnswerOnly { answer: String, citations: Vec<usize> },
    /// Anything else; the raw reply is the answer
    Malformed { raw: String },
}

impl ReplyShape {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplyShape::Full { .. } => "full",
            ReplyShape::AnswerOnly { .. } => "answer_only",
            ReplyShape::Malformed { .. } => "malformed",
        }
    }
}

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[citation:\s*(\d+)\s*\]").expect("citation pattern is valid"))
}

/// 1-based citation indices in order of first appearance
pub fn extract_citations(answer: &str) -> Vec<usize> {
    let mut indices = Vec::new();
    for cap in citation_pattern().captures_iter(answer) {
        if let Some(idx) = cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) {
            if idx > 0 && !indices.contains(&idx) {
                indices.push(idx);
            }
        }
    }
    indices
}

enum Inline {
    None,
    Closed { thinking: String, answer: String },
    Unclosed,
}

fn split_inline(content: &str) -> Inline {
    let opened = TAGS
        .iter()
        .filter_map(|(open, close)| content.find(open).map(|pos| (pos, *open, *close)))
        .min_by_key(|(pos, _, _)| *pos);

    if let Some((pos, open, close)) = opened {
        let after_open = pos + open.len();
        return match content[after_open..].find(close) {
            Some(rel) => {
                let close_at = after_open + rel;
                let thinking = content[after_open..close_at].trim().to_string();
                // Text on both sides of the block stays two paragraphs
                let answer = [content[..pos].trim(), content[close_at + close.len()..].trim()]
                    .into_iter()
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                Inline::Closed { thinking, answer }
            }
            None => Inline::Unclosed,
        };
    }

    // Reasoning models often emit only the closing tag
    for (_, close) in TAGS {
        if let Some(close_at) = content.find(close) {
            return Inline::Closed {
                thinking: content[..close_at].trim().to_string(),
                answer: content[close_at + close.len()..].trim().to_string(),
            };
        }
    }
    Inline::None
}

/// Classify a completion
pub fn parse_reply(completion: &Completion) -> ReplyShape {
    let content = completion.content.trim();
    let malformed = || ReplyShape::Malformed {
        raw: content.to_string(),
    };

    match split_inline(content) {
        Inline::Unclosed => malformed(),
        Inline::Closed { thinking, answer } => {
            if answer.is_empty() {
                return malformed();
            }
            let citations = extract_citations(&answer);
            if thinking.is_empty() {
                ReplyShape::AnswerOnly { answer, citations }
            } else {
                ReplyShape::Full {
                    thinking,
                    answer,
                    citations,
                }
            }
        }
        Inline::None => {
            if content.is_empty() {
                return malformed();
            }
            let answer = content.to_string();
            let citations = extract_citations(&answer);
            match completion.reasoning.as_deref().map(str::trim) {
                Some(thinking) if !thinking.is_empty() => ReplyShape::Full {
                    thinking: thinking.to_string(),
                    answer,
                    citations,
                },
                _ => ReplyShape::AnswerOnly { answer, citations },
            }
        }
    }
}
