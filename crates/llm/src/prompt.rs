//! Prompt assembly from dialogue context

use confab_core::{DialogueTurn, Role};

use crate::client::ChatMessage;

/// Build the chat request messages: context snapshot, then the committed
/// user utterance.
///
/// Failure-marker turns are skipped: the apology line stands in for content
/// the model never produced, and replaying it teaches the model to
/// apologize. Truncated assistant turns are real partial content and stay.
pub fn build_messages(context: &[DialogueTurn], user_text: &str) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = context
        .iter()
        .filter(|turn| !turn.failed)
        .map(|turn| ChatMessage::new(turn.role.as_str(), turn.text.clone()))
        .collect();
    messages.push(ChatMessage::new(Role::User.as_str(), user_text));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::DialogueContext;

    #[test]
    fn test_messages_order_and_roles() {
        let mut ctx = DialogueContext::new(Some("Be brief."), 16, 4096);
        ctx.push(DialogueTurn::new(Role::User, "Hello"));
        ctx.push(DialogueTurn::new(Role::Assistant, "Hi there!"));

        let messages = build_messages(&ctx.snapshot(), "What's the weather?");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].content, "What's the weather?");
    }

    #[test]
    fn test_failure_markers_skipped() {
        let mut ctx = DialogueContext::new(None, 16, 4096);
        ctx.push(DialogueTurn::new(Role::User, "Hello"));
        ctx.push(DialogueTurn::failure_marker("Sorry, I had trouble answering."));

        let messages = build_messages(&ctx.snapshot(), "Again?");
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role != "assistant"));
    }

    #[test]
    fn test_truncated_turns_kept() {
        let mut ctx = DialogueContext::new(None, 16, 4096);
        ctx.push(DialogueTurn::truncated(Role::Assistant, "Once upon a"));

        let messages = build_messages(&ctx.snapshot(), "Go on");
        assert_eq!(messages[0].content, "Once upon a");
    }
}
