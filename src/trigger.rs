use crate::store::Conversation;
use once_cell::sync::Lazy;
use regex::Regex;

// `/ai` or `/iaMeta` at the start of the message; everything after it is the
// prompt. `(?s)` lets the prompt span lines.
static SLASH_COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?si)^\s*/(?:ai|iameta)\s*(.*)$").expect("trigger pattern is valid")
});

/// Slash-command detection only. Returns the trimmed remainder as prompt,
/// which may be empty.
pub fn detect(text: &str) -> (bool, String) {
    match SLASH_COMMAND.captures(text) {
        Some(caps) => {
            let prompt = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            (true, prompt.to_string())
        }
        None => (false, String::new()),
    }
}

/// Full trigger rules for a message posted by `author_id` into `conversation`.
/// `None` means no reply should be produced.
pub fn evaluate(
    text: &str,
    conversation: &Conversation,
    author_id: Option<i64>,
    bot_id: i64,
) -> Option<String> {
    if author_id == Some(bot_id) {
        return None;
    }

    let (triggered, prompt) = detect(text);
    let prompt = if triggered {
        prompt
    } else if conversation.is_direct_with(bot_id) {
        text.trim().to_string()
    } else {
        return None;
    };

    (!prompt.is_empty()).then_some(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConversationKind;

    const BOT: i64 = 1;
    const HUMAN: i64 = 2;

    fn conversation(kind: ConversationKind, members: &[i64]) -> Conversation {
        Conversation {
            id: 10,
            name: "test".into(),
            kind,
            members: members.to_vec(),
        }
    }

    #[test]
    fn slash_command_with_prompt() {
        assert_eq!(detect("/ai hello"), (true, "hello".to_string()));
    }

    #[test]
    fn slash_command_without_prompt() {
        assert_eq!(detect("/iaMeta   "), (true, String::new()));
    }

    #[test]
    fn command_must_lead_the_message() {
        assert_eq!(detect("hello /ai"), (false, String::new()));
    }

    #[test]
    fn aliases_are_case_insensitive() {
        assert_eq!(detect("/AI what"), (true, "what".to_string()));
        assert_eq!(detect("  /IAMETA  what"), (true, "what".to_string()));
    }

    #[test]
    fn prompt_spans_lines() {
        assert_eq!(
            detect("/ai\nfirst line\nsecond line\n"),
            (true, "first line\nsecond line".to_string())
        );
    }

    #[test]
    fn whitespace_after_alias_is_optional() {
        assert_eq!(detect("/aihello"), (true, "hello".to_string()));
        assert_eq!(detect("/iaMetawhat now"), (true, "what now".to_string()));
        assert_eq!(detect("/ai"), (true, String::new()));
    }

    #[test]
    fn direct_conversation_with_bot_uses_whole_text() {
        let dm = conversation(ConversationKind::Direct, &[BOT, HUMAN]);
        assert_eq!(
            evaluate("what's 2+2?", &dm, Some(HUMAN), BOT),
            Some("what's 2+2?".to_string())
        );
    }

    #[test]
    fn slash_command_wins_in_direct_conversation() {
        let dm = conversation(ConversationKind::Direct, &[BOT, HUMAN]);
        assert_eq!(
            evaluate("/ai summarize", &dm, Some(HUMAN), BOT),
            Some("summarize".to_string())
        );
    }

    #[test]
    fn bot_authored_messages_never_trigger() {
        let dm = conversation(ConversationKind::Direct, &[BOT, HUMAN]);
        assert_eq!(evaluate("hello there", &dm, Some(BOT), BOT), None);
        assert_eq!(evaluate("/ai loop forever", &dm, Some(BOT), BOT), None);
    }

    #[test]
    fn group_without_command_does_not_trigger() {
        let group = conversation(ConversationKind::Group, &[BOT, HUMAN]);
        assert_eq!(evaluate("just chatting", &group, Some(HUMAN), BOT), None);
    }

    #[test]
    fn direct_conversation_without_bot_does_not_trigger() {
        let dm = conversation(ConversationKind::Direct, &[HUMAN, 3]);
        assert_eq!(evaluate("hi", &dm, Some(HUMAN), BOT), None);
    }

    #[test]
    fn three_member_direct_conversation_does_not_trigger() {
        let dm = conversation(ConversationKind::Direct, &[BOT, HUMAN, 3]);
        assert_eq!(evaluate("hi", &dm, Some(HUMAN), BOT), None);
    }

    #[test]
    fn empty_prompt_does_not_trigger() {
        let group = conversation(ConversationKind::Group, &[BOT, HUMAN]);
        assert_eq!(evaluate("/ai   ", &group, Some(HUMAN), BOT), None);
        let dm = conversation(ConversationKind::Direct, &[BOT, HUMAN]);
        assert_eq!(evaluate("   ", &dm, Some(HUMAN), BOT), None);
    }
}
