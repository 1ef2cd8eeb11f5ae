//! Prompt templates for grounded and ungrounded answers

use chrono::NaiveDate;

use crate::assembler::AssembledContext;

pub const SYSTEM_PROMPT: &str =
    "You are GeoForge, an AI assistant specialized in geospatial analysis and GIS workflows.";

pub const THINKING_INSTRUCTION: &str = "Think through the problem step by step before answering. \
Structure your response as:\n\n<think>\n[your reasoning]\n</think>\n\n[your final answer]\n\n";

/// Chat prompt: grounded template when context exists, expert template otherwise
pub fn chat_prompt(
    context: &AssembledContext,
    question: &str,
    include_thinking: bool,
    today: NaiveDate,
) -> String {
    let body = if context.is_empty() {
        format!(
            "Today is {today}.\n\n\
             User question: {question}\n\n\
             No documents were found for this question. Answer from your geospatial \
             expertise, say where the answer would benefit from local data, and do not \
             invent citations."
        )
    } else {
        grounded_prompt(context, question, today)
    };

    if include_thinking {
        format!("{}{}", THINKING_INSTRUCTION, body)
    } else {
        body
    }
}

fn grounded_prompt(context: &AssembledContext, question: &str, today: NaiveDate) -> String {
    format!(
        "# Search results related to the user's message:\n\
         {documents}\n\
         Each result is wrapped as [document X begin]...[document X end], where X is its index. \
         Cite a result right after the sentence that uses it, in the form [citation:X]. \
         When a sentence draws on several results, list each one, e.g. [citation:2][citation:4]. \
         Do not collect all citations at the end.\n\
         Keep in mind:\n\
         - Today is {today}.\n\
         - Some results may be unrelated to the question; judge and filter them.\n\
         - If every result is irrelevant, answer professionally from your own knowledge.\n\
         - Prefer concrete figures, coordinates, units and place names when the results provide them.\n\
         - Structure long answers in short paragraphs or at most five points.\n\
         - Answer in the language of the question.\n\
         # The user's message is:\n\
         {question}",
        documents = context.render(),
        today = today,
        question = question,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoforge_common::models::{ContextChunk, Origin};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap_or_default()
    }

    #[test]
    fn test_empty_context_uses_expert_prompt() {
        let prompt = chat_prompt(&AssembledContext::default(), "What is a delta?", false, today());
        assert!(prompt.contains("User question: What is a delta?"));
        assert!(prompt.contains("Today is 2026-03-14"));
        assert!(!prompt.contains("[document"));
        assert!(!prompt.contains("<think>"));
    }

    #[test]
    fn test_grounded_prompt_embeds_documents() {
        let context = AssembledContext {
            chunks: vec![ContextChunk::snippet("d", None, "Deltas subside.", 0.9, Origin::KnowledgeBase)],
            total_chars: 15,
            truncated: false,
        };
        let prompt = chat_prompt(&context, "Why do deltas sink?", true, today());
        assert!(prompt.starts_with(THINKING_INSTRUCTION));
        assert!(prompt.contains("[document 1 begin]"));
        assert!(prompt.contains("[citation:X]"));
        assert!(prompt.ends_with("Why do deltas sink?"));
    }
}
