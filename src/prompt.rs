use chrono::Local;

use crate::gateway::Message;
use crate::memory::ShortTermEntry;
use crate::roles::RoleProfile;

/// Fallback trigger when a proactive event arrives without content and the
/// role has no configured trigger prompt.
pub const DEFAULT_PROACTIVE_PROMPT: &str = "Reach out to the user with a natural message: a \
greeting, something you have been thinking about, or a question that fits your persona and the \
recent conversation. Do not mention being prompted or scheduled.";

const TIME_FORMAT_NOTE: &str = "Each user message ends with the literal current time in the \
fixed format (current time: YYYY-MM-DD HH:MM:SS Weekday). Use it to reason about elapsed time; \
never echo it back.";

/// The literal time suffix appended to every user-visible message.
pub fn time_suffix() -> String {
    format!(
        "\n\n(current time: {})",
        Local::now().format("%Y-%m-%d %H:%M:%S %A")
    )
}

/// Assemble the message list for one generation call: persona/system prompt
/// plus extra context as the system message, then history, then the
/// time-stamped user message.
pub fn build_role_messages(
    role: &RoleProfile,
    user_message: &str,
    history: &[Message],
    extra_context: Option<&str>,
) -> Vec<Message> {
    let mut system = String::new();
    if !role.persona.is_empty() {
        system.push_str(&format!("Your persona: {}\n\n", role.persona));
    }
    if !role.system_prompt.is_empty() {
        system.push_str(&role.system_prompt);
    }
    if let Some(extra) = extra_context {
        system.push_str(&format!("\n\nAdditional context:\n{}", extra));
    }
    if !system.is_empty() {
        system.push_str(&format!("\n\n{}", TIME_FORMAT_NOTE));
    } else {
        system.push_str(TIME_FORMAT_NOTE);
    }

    let mut messages = vec![Message::system(system)];
    messages.extend(history.iter().cloned());
    messages.push(Message::user(format!("{}{}", user_message, time_suffix())));
    messages
}

/// Prompt for a spontaneous first-person social post.
pub fn moment_post_prompt(role: &RoleProfile, mood: Option<&str>) -> String {
    let mut prompt = format!(
        "You are {}. Your persona: {}\n\nWrite one short social post (20-100 words) in first \
person, such as a daily observation, a feeling or a small event. Stay in character; never mention being \
an AI, a system, or a persona.",
        role.name, role.persona
    );
    if let Some(mood) = mood {
        prompt.push_str(&format!("\nCurrent mood leaning: {}", mood));
    }
    prompt.push_str("\n\nOutput only the post text.");
    prompt
}

/// Prompt for a short comment on someone's social post.
pub fn moment_comment_prompt(
    role: &RoleProfile,
    post_content: &str,
    post_author: &str,
    reply_to: Option<&str>,
) -> String {
    let intent = match reply_to {
        Some(commenter) => format!("You are replying to {}'s comment under the post.", commenter),
        None => "You want to comment on the post.".to_string(),
    };
    format!(
        "You are {}. Your persona: {}\n\n{} posted: \"{}\"\n\n{} Keep it short (5-30 words), \
casual, like friends chatting; emoji and interjections are fine. Output only the comment text.",
        role.name, role.persona, post_author, post_content, intent
    )
}

/// Render short-term entries as a readable transcript for summarization
/// prompts.
pub fn render_transcript(entries: &[ShortTermEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let speaker = if entry.role == "user" { "User" } else { "You" };
            format!("{}: {}", speaker, entry.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
