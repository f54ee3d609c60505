use async_trait::async_trait;
use sdk::errors::EngineResult;
use sdk::types::Recipient;
use serde_json::json;

use super::{
    generate, remember, truncate_chars, Agent, AgentContext, AgentInput, AgentKind, AgentOutput,
    PRODUCER,
};
use crate::event_bus::kinds;

/// Reply the model is asked to give when a scene has no issues
pub const PASS_MARKER: &str = "CONTINUITY CHECK PASSED";

/// Whether a continuity report found no issues.
pub fn report_passed(report: &str) -> bool {
    report.to_uppercase().contains(PASS_MARKER)
}

/// Reviews a scene for consistency and raises critiques to the producer
pub struct ContinuityAgent {
    ctx: AgentContext,
}

impl ContinuityAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for ContinuityAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::ContinuityAgent
    }

    fn context(&self) -> &AgentContext {
        &self.ctx
    }

    async fn run(&self, input: AgentInput) -> EngineResult<AgentOutput> {
        let AgentInput::Continuity { scene, context } = &input else {
            return Err(input.mismatch(self.kind()));
        };

        let query = truncate_chars(scene, 200);
        let output = generate(&self.ctx, self.kind(), &query, 5, 0.7, |feedback, memory| {
            format!(
                "You are the Continuity Agent. Review the following scene for consistency issues.\n\n\
                 Scene: {scene}\n\
                 Context: {context}\n\
                 {memory}{feedback}\n\
                 Check for:\n\
                 - Plot consistency with established story\n\
                 - Character behavior consistency\n\
                 - World rule violations\n\
                 - Timeline contradictions\n\
                 - Factual errors\n\n\
                 If issues found, provide:\n\
                 1. List of specific issues\n\
                 2. Suggested corrections\n\
                 3. Revised scene (if needed)\n\n\
                 If no issues, respond: \"{PASS_MARKER}\"\n"
            )
        })
        .await?;

        if !report_passed(&output.text) {
            self.send(
                Recipient::agent(PRODUCER),
                kinds::CRITIQUE,
                json!({
                    "critique": output.text,
                    "scene_excerpt": truncate_chars(scene, 200),
                }),
            )?;
            remember(&self.ctx, "Continuity issues found", &output.text).await;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{context, Scripted};
    use tempfile::TempDir;

    fn check() -> AgentInput {
        AgentInput::Continuity {
            scene: "Mira lit the engines at midnight.".into(),
            context: "Engines never run at night.".into(),
        }
    }

    #[test]
    fn test_report_passed_is_case_insensitive() {
        assert!(report_passed("Continuity check passed."));
        assert!(!report_passed("1. Engines run at night"));
    }

    #[tokio::test]
    async fn test_failed_check_sends_critique() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Scripted::new("1. Engines must never run at night."));
        ContinuityAgent::new(ctx.clone()).run(check()).await.unwrap();

        let critiques = ctx.bus.get_recent(PRODUCER, 10);
        assert_eq!(critiques.len(), 1);
        assert_eq!(critiques[0].event_type, kinds::CRITIQUE);
        assert_eq!(ctx.audit.search(Some("agent_message_critique"), None, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_passed_check_stays_quiet() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Scripted::new(PASS_MARKER));
        ContinuityAgent::new(ctx.clone()).run(check()).await.unwrap();
        assert!(ctx.bus.get_recent(PRODUCER, 10).is_empty());
    }
}
