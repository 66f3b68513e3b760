//! Prompt table for intent classification and reply generation.

use crate::pipeline::types::{Intent, LeadContext};

/// System prompt for the intent classifier.
pub const CLASSIFY_SYSTEM_PROMPT: &str = "You are an intent classifier for a sales assistant. \
Classify the user's message into exactly one of these categories:\n\
- buy: the user wants to purchase, book, or sign up.\n\
- doubt: the user has a question, an objection, or needs more information.\n\
- unknown: anything else.\n\n\
Return ONLY the category name, in lowercase, with no punctuation.";

/// Reply used when a generated answer fails output validation.
pub const FALLBACK_REPLY: &str = "I'm sorry, I can't help with that right now. \
A member of our team will follow up with you shortly.";

/// Context keys never rendered into the prompt; the reply doesn't need them.
const HIDDEN_CONTEXT_KEYS: &[&str] = &["phone", "email"];

/// Per-intent instruction appended to the reply system prompt.
pub fn intent_instruction(intent: Intent) -> &'static str {
    match intent {
        Intent::Buy => {
            "The lead wants to buy. Encourage them to book a call or finalize the purchase, \
             and make the next step concrete."
        }
        Intent::Doubt => {
            "The lead has a question or an objection. Answer it directly and reassure them."
        }
        Intent::Unknown => {
            "The lead's intent is unclear. Ask a short, friendly question to clarify what they need."
        }
    }
}

/// Build the reply system prompt. The lead context is rendered read-only.
pub fn build_reply_system_prompt(context: &LeadContext, intent: Intent) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(
        "You are a helpful sales assistant having a conversation with a lead. \
         Reply in the same language the lead writes in. Keep replies short and natural.\n",
    );

    let rendered = render_context(context);
    if !rendered.is_empty() {
        prompt.push_str("\nContext about the lead:\n");
        prompt.push_str(&rendered);
    }

    prompt.push_str(&format!("\nCurrent intent: {}\n", intent.label()));
    prompt.push_str(intent_instruction(intent));
    prompt
}

fn render_context(context: &LeadContext) -> String {
    let mut out = String::new();
    if let Some(name) = context.name.as_deref().filter(|n| !n.trim().is_empty()) {
        out.push_str(&format!("- name: {}\n", name.trim()));
    }
    for (key, value) in &context.extra {
        if HIDDEN_CONTEXT_KEYS.contains(&key.as_str()) {
            continue;
        }
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => continue,
            other => other.to_string(),
        };
        out.push_str(&format!("- {key}: {value}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_prompt_lists_every_intent() {
        for intent in Intent::ALL {
            assert!(CLASSIFY_SYSTEM_PROMPT.contains(&format!("- {}:", intent.label())));
        }
    }

    #[test]
    fn instruction_table_is_per_intent() {
        assert!(intent_instruction(Intent::Buy).contains("book a call"));
        assert!(intent_instruction(Intent::Doubt).contains("reassure"));
        assert!(intent_instruction(Intent::Unknown).contains("clarify"));
    }

    #[test]
    fn reply_prompt_embeds_context_and_intent() {
        let ctx = LeadContext::new("lead-7")
            .with_name("Ana")
            .with_attr("plan", "premium");
        let prompt = build_reply_system_prompt(&ctx, Intent::Doubt);
        assert!(prompt.contains("- name: Ana"));
        assert!(prompt.contains("- plan: premium"));
        assert!(prompt.contains("Current intent: doubt"));
        assert!(prompt.contains(intent_instruction(Intent::Doubt)));
    }

    #[test]
    fn reply_prompt_hides_contact_details() {
        let ctx = LeadContext::new("lead-7")
            .with_attr("phone", "+34600111222")
            .with_attr("email", "ana@example.com");
        let prompt = build_reply_system_prompt(&ctx, Intent::Buy);
        assert!(!prompt.contains("+34600111222"));
        assert!(!prompt.contains("ana@example.com"));
        assert!(!prompt.contains("Context about the lead"));
    }

    #[test]
    fn reply_prompt_leaves_context_untouched() {
        let ctx = LeadContext::new("lead-7").with_attr("plan", "basic");
        let before = ctx.clone();
        let _ = build_reply_system_prompt(&ctx, Intent::Unknown);
        assert_eq!(ctx, before);
    }
}
