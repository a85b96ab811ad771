//! Loop prompt assembly
//!
//! The prompt is a handlebars template over the gathered context. Sections
//! with nothing to say disappear entirely; the output contract is always the
//! final section.

use eyre::{Context as _, Result};
use handlebars::Handlebars;
use serde_json::json;

use crate::profile::Profile;

use super::executor::LoopContext;

const LOOP_PROMPT_TEMPLATE: &str = "\
{{system_prompt}}

## Trigger
{{trigger}}{{#if message_line}} - {{message_line}}{{/if}}

## Your state
{{state}}

{{#if decisions}}## Pending decisions (vote with a `vote` action)
{{#each decisions}}- [{{tier}}] {{id}}: {{title}} (proposed by {{proposed_by}})
{{/each}}
{{/if}}{{#if tasks}}## Claimed tasks (highest priority first)
{{#each tasks}}- [{{priority}}] {{title}}: {{description}}
{{/each}}
{{/if}}{{#if rag}}## Relevant context
{{rag}}

{{/if}}## Board
{{kanban}}

{{#if brand}}## Brand
{{brand}}

{{/if}}{{#if initiative_context}}## Idle guidance
{{initiative_context}}

{{/if}}## Output contract
Reply with one JSON object containing any of: actions[] ({type, data}), \
messages[] ({to, type, payload, priority}), stateUpdates{}, summary.";

/// Renders loop prompts; the template is registered once
pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string("loop", LOOP_PROMPT_TEMPLATE)
            .context("Failed to register loop prompt template")?;
        Ok(Self { handlebars })
    }

    /// Render the full loop prompt
    pub fn build(&self, profile: &Profile, ctx: &LoopContext) -> Result<String> {
        let message_line = ctx.message.as_ref().map(|m| {
            format!(
                "message from {} ({}): {}",
                m.from,
                m.kind,
                serde_json::to_string(&m.payload).unwrap_or_default()
            )
        });

        let decisions: Vec<serde_json::Value> = ctx
            .decisions
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "title": d.title,
                    "tier": d.tier.as_str(),
                    "proposed_by": d.proposed_by,
                })
            })
            .collect();

        let tasks: Vec<serde_json::Value> = ctx
            .tasks
            .iter()
            .map(|c| {
                json!({
                    "priority": c.item.priority.as_str(),
                    "title": c.item.title,
                    "description": c.item.description,
                })
            })
            .collect();

        let data = json!({
            "system_prompt": profile.system_prompt,
            "trigger": ctx.trigger.as_str(),
            "message_line": message_line,
            "state": ctx.essential.summary(),
            "decisions": decisions,
            "tasks": tasks,
            "rag": if ctx.rag_context.is_empty() { None } else { Some(&ctx.rag_context) },
            "kanban": ctx.kanban.summary(),
            "brand": ctx.brand,
            "initiative_context": ctx.initiative_context,
        });

        self.handlebars.render("loop", &data).context("Failed to render loop prompt")
    }

    /// The trimmed delta prompt for session-pool mode: profile context is
    /// already resident in the conversation, so the system prompt is omitted.
    pub fn build_delta(&self, profile: &Profile, ctx: &LoopContext) -> Result<String> {
        let full = self.build(profile, ctx)?;
        Ok(full
            .strip_prefix(profile.system_prompt.as_str())
            .map(|rest| rest.trim_start().to_string())
            .unwrap_or(full))
    }
}
