//! ChatML prompt assembly

use crate::conversation::{Message, Role};

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Answer the user's questions concisely.";

fn push_turn(out: &mut String, role: Role, content: &str) {
    out.push_str(IM_START);
    out.push_str(role.as_str());
    out.push('\n');
    out.push_str(content);
    out.push_str(IM_END);
    out.push('\n');
}

/// Build the full context: system turn, retained history, the new user
/// turn, then an open assistant turn for the model to complete.
pub fn build_chatml<'a>(
    system_prompt: &str,
    history: impl IntoIterator<Item = &'a Message>,
    user_input: &str,
) -> String {
    let mut out = String::new();
    push_turn(&mut out, Role::System, system_prompt);
    for message in history {
        push_turn(&mut out, message.role(), message.content());
    }
    push_turn(&mut out, Role::User, user_input);
    out.push_str(IM_START);
    out.push_str(Role::Assistant.as_str());
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history() {
        let prompt = build_chatml("Be brief.", std::iter::empty(), "Hi");
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_history_order_is_preserved() {
        let history = vec![Message::user("q1"), Message::assistant("a1")];
        let prompt = build_chatml(DEFAULT_SYSTEM_PROMPT, &history, "q2");

        let q1 = prompt.find("user\nq1").unwrap();
        let a1 = prompt.find("assistant\na1").unwrap();
        let q2 = prompt.find("user\nq2").unwrap();
        assert!(q1 < a1 && a1 < q2);
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }
}
