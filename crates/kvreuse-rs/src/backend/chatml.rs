//! ChatML-style prompt template.

use super::{PromptTemplate, RenderOptions};
use crate::error::TemplateError;
use crate::{Message, Tool};
use std::fmt::Write;

/// Renders messages as `<|im_start|>role\ncontent<|im_end|>\n` blocks.
///
/// Tools are described in a leading system block as one JSON object per
/// line, followed by the first message if it is a system message (so a
/// system prompt and the tool block share one turn).
#[derive(Debug, Clone)]
pub struct ChatMlTemplate {
    bos: String,
}

impl ChatMlTemplate {
    pub fn new() -> Self {
        Self { bos: String::new() }
    }

    /// Prefix every rendering with a BOS marker such as `"<s>"`.
    pub fn with_bos(mut self, bos: impl Into<String>) -> Self {
        self.bos = bos.into();
        self
    }

    fn render_tools(tools: &[Tool]) -> Result<String, TemplateError> {
        let mut block = String::from("# Tools\n\nYou may call one or more functions:\n<tools>\n");
        for tool in tools {
            let line = serde_json::to_string(&serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            }))
            .map_err(|e| TemplateError(format!("failed to serialize tool '{}': {e}", tool.name)))?;
            block.push_str(&line);
            block.push('\n');
        }
        block.push_str("</tools>");
        Ok(block)
    }
}

impl Default for ChatMlTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptTemplate for ChatMlTemplate {
    fn render(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: RenderOptions,
    ) -> Result<String, TemplateError> {
        let mut out = self.bos.clone();
        let mut rest = messages;

        if !tools.is_empty() {
            let mut system = String::new();
            if let Some((first, tail)) = messages.split_first()
                && first.role == crate::MessageRole::System
            {
                system.push_str(&first.content);
                system.push_str("\n\n");
                rest = tail;
            }
            system.push_str(&Self::render_tools(tools)?);
            let _ = write!(out, "<|im_start|>system\n{system}<|im_end|>\n");
        }

        for msg in rest {
            let _ = write!(out, "<|im_start|>{}\n{}<|im_end|>\n", msg.role, msg.content);
        }

        if options.add_generation_prompt {
            out.push_str("<|im_start|>assistant\n");
        }
        Ok(out)
    }
}
