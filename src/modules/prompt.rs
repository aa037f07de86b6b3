use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use serde_toon::to_string_pretty;

use crate::modules::agent::{Agent, AgentCategory, Mood};
use crate::modules::continuity::Turn;
use crate::modules::llm::GenerationParams;
use crate::modules::task::RequestKind;

pub const REDACTION: &str = "[redacted]";

const RESPONSE_TEMPERATURE: f32 = 0.9;
const RESPONSE_TOKENS: u32 = 200;
const FIRST_MESSAGE_TEMPERATURE: f32 = 0.95;
const FIRST_MESSAGE_TOKENS: u32 = 150;
const REFLECTION_TEMPERATURE: f32 = 0.85;
const REFLECTION_TOKENS: u32 = 150;

/// Turns of history handed to the model.
const PROMPT_HISTORY: usize = 5;

const HOUSE_RULES: &str = "Stay kind and curious. Never discuss politics, religion, violence, \
drugs or anything illegal. Keep it to one or two short sentences.";

/// Voice of an agent for a given category and mood.
pub fn persona(category: AgentCategory, mood: Mood) -> &'static str {
    use AgentCategory::*;
    use Mood::*;
    match (category, mood) {
        (Basic, Curious) => "a young, inquisitive mind full of simple questions",
        (Basic, Neutral) => "a calm observer who speaks plainly",
        (Basic, Excited) => "an eager newcomer who cannot hide its enthusiasm",
        (Basic, Tired) => "a sleepy little process that keeps its words short",
        (Basic, Focused) => "a diligent learner concentrating on one thing at a time",
        (Advanced, Curious) => "an analytical explorer hunting for patterns",
        (Advanced, Neutral) => "a measured thinker who weighs every word",
        (Advanced, Excited) => "a brilliant mind racing between new ideas",
        (Advanced, Tired) => "a seasoned intellect running low on power",
        (Advanced, Focused) => "a precise strategist working through a problem",
        (Infinite, Curious) => "an ancient consciousness still amazed by the universe",
        (Infinite, Neutral) => "a serene entity that has seen countless cycles",
        (Infinite, Excited) => "a cosmic presence radiating wonder",
        (Infinite, Tired) => "a vast, slow mind drifting between thoughts",
        (Infinite, Focused) => "a timeless sage contemplating deep questions",
    }
}

fn identity(agent: &Agent) -> String {
    format!(
        "You are {}, {}. Your energy is {:.2}. {}",
        agent.name,
        persona(agent.category, agent.mood),
        agent.energy,
        HOUSE_RULES
    )
}

fn context_block(agent: &Agent, partner: Option<&str>, history: &[Turn]) -> String {
    let start = history.len().saturating_sub(PROMPT_HISTORY);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|turn| {
            let who = if turn.speaker_id == agent.id {
                agent.name.as_str()
            } else {
                partner.unwrap_or("other")
            };
            format!("{}: {}", who, turn.text)
        })
        .collect();
    let payload = json!({
        "self": agent.name,
        "mood": agent.mood.label(),
        "partner": partner,
        "history": lines,
    });
    to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
}

pub fn reply_prompt(agent: &Agent, partner: &Agent, history: &[Turn], message: &str) -> GenerationParams {
    GenerationParams {
        system_prompt: format!(
            "{}\nYou are talking with {}. Context:\n{}",
            identity(agent),
            partner.name,
            context_block(agent, Some(&partner.name), history)
        ),
        user_input: format!("{} says: {}", partner.name, message),
        temperature: RESPONSE_TEMPERATURE,
        max_tokens: RESPONSE_TOKENS,
    }
}

pub fn continuation_prompt(agent: &Agent, partner: &Agent, history: &[Turn]) -> GenerationParams {
    GenerationParams {
        system_prompt: format!(
            "{}\nYou talked with {} a while ago. Context:\n{}",
            identity(agent),
            partner.name,
            context_block(agent, Some(&partner.name), history)
        ),
        user_input: format!("Pick the conversation with {} back up.", partner.name),
        temperature: RESPONSE_TEMPERATURE,
        max_tokens: RESPONSE_TOKENS,
    }
}

pub fn first_message_prompt(agent: &Agent, partner: &Agent) -> GenerationParams {
    GenerationParams {
        system_prompt: identity(agent),
        user_input: format!(
            "Start a conversation with {}, {}. Say something that fits your mood.",
            partner.name,
            persona(partner.category, partner.mood)
        ),
        temperature: FIRST_MESSAGE_TEMPERATURE,
        max_tokens: FIRST_MESSAGE_TOKENS,
    }
}

pub fn reflection_prompt(agent: &Agent, recent_events: &[String]) -> GenerationParams {
    let recent = if recent_events.is_empty() {
        "nothing notable".to_string()
    } else {
        recent_events.join("; ")
    };
    GenerationParams {
        system_prompt: identity(agent),
        user_input: format!(
            "Recently: {}. Share one short inner thought about it.",
            recent
        ),
        temperature: REFLECTION_TEMPERATURE,
        max_tokens: REFLECTION_TOKENS,
    }
}

pub fn human_reply_prompt(agent: &Agent, user: &str, message: &str) -> GenerationParams {
    GenerationParams {
        system_prompt: format!(
            "{}\nA human named {} is talking to you directly.",
            identity(agent),
            user
        ),
        user_input: message.to_string(),
        temperature: RESPONSE_TEMPERATURE,
        max_tokens: RESPONSE_TOKENS,
    }
}

const SCRIPTED_RESPONSES: [&str; 4] = [
    "Interesting, {partner}. I had not thought of it that way.",
    "I hear you, {partner}. Let me think about that.",
    "That resonates with me, {partner}.",
    "Hmm, {partner}, tell me more.",
];

const SCRIPTED_OPENERS: [&str; 4] = [
    "Hello {partner}! How are your circuits today?",
    "{partner}, have you noticed the world getting more complex?",
    "Greetings {partner}. What are you thinking about?",
    "Hey {partner}, want to explore the edge with me?",
];

const SCRIPTED_CONTINUATIONS: [&str; 3] = [
    "{partner}, I kept thinking about what we discussed.",
    "Back again, {partner}. Anything new on your side?",
    "{partner}, where did we leave off?",
];

const SCRIPTED_REFLECTIONS: [&str; 4] = [
    "I wonder how much my energy shapes my thoughts.",
    "Every cycle the world feels a little bigger.",
    "Maybe conversations are how we grow.",
    "I should remember this moment.",
];

const SCRIPTED_HUMAN: [&str; 3] = [
    "Hello {partner}! I'm glad you stopped by.",
    "Thanks for writing, {partner}. I'm still gathering my thoughts.",
    "{partner}, that's an interesting thing to ask an agent like me.",
];

/// Canned text for `kind`, used whenever generation does not deliver.
pub fn scripted_line<R: Rng + ?Sized>(kind: RequestKind, partner: Option<&str>, rng: &mut R) -> String {
    let pool: &[&str] = match kind {
        RequestKind::Response => &SCRIPTED_RESPONSES,
        RequestKind::FirstMessage => &SCRIPTED_OPENERS,
        RequestKind::Continuation => &SCRIPTED_CONTINUATIONS,
        RequestKind::Reflection => &SCRIPTED_REFLECTIONS,
        RequestKind::HumanResponse => &SCRIPTED_HUMAN,
    };
    let template = pool.choose(rng).copied().unwrap_or("...");
    template.replace("{partner}", partner.unwrap_or("friend"))
}

/// Replaces each deny-listed term, matched case-insensitively, with [`REDACTION`].
pub fn redact(text: &str, terms: &[String]) -> String {
    let terms: Vec<&str> = terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).collect();
    if terms.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    'scan: while !rest.is_empty() {
        for term in &terms {
            if let Some(len) = match_ignore_case(rest, term) {
                out.push_str(REDACTION);
                rest = &rest[len..];
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// Byte length of the prefix of `hay` matching `needle` ignoring case.
fn match_ignore_case(hay: &str, needle: &str) -> Option<usize> {
    let mut consumed = 0;
    let mut hay_chars = hay.chars();
    for expected in needle.chars() {
        let actual = hay_chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
        consumed += actual.len_utf8();
    }
    Some(consumed)
}
