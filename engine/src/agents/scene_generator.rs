use async_trait::async_trait;
use sdk::errors::EngineResult;

use super::{
    generate, remember, Agent, AgentContext, AgentInput, AgentKind, AgentOutput, Revision,
};

/// Drafts (or revises) a scene from the story bible
pub struct SceneGenerator {
    ctx: AgentContext,
}

impl SceneGenerator {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

fn canon_section(canon: &[String]) -> String {
    if canon.is_empty() {
        return String::new();
    }
    let rules: Vec<String> = canon.iter().map(|r| format!("- {}", r)).collect();
    format!("\n[Canon Rules] (must not be violated):\n{}\n", rules.join("\n"))
}

fn revision_section(revise: Option<&Revision>) -> String {
    match revise {
        Some(r) => format!(
            "\nPrevious Draft:\n{}\n\nCritique to address:\n{}\n\nRewrite the scene so the critique no longer applies.\n",
            r.draft, r.critique
        ),
        None => String::new(),
    }
}

#[async_trait]
impl Agent for SceneGenerator {
    fn kind(&self) -> AgentKind {
        AgentKind::SceneGenerator
    }

    fn context(&self) -> &AgentContext {
        &self.ctx
    }

    async fn run(&self, input: AgentInput) -> EngineResult<AgentOutput> {
        let AgentInput::Scene {
            goal,
            outline_excerpt,
            world,
            characters,
            canon,
            revise,
        } = &input
        else {
            return Err(input.mismatch(self.kind()));
        };

        let canon = canon_section(canon);
        let revision = revision_section(revise.as_ref());
        let output = generate(&self.ctx, self.kind(), goal, 5, 0.8, |feedback, memory| {
            format!(
                "You are the Scene Generator. Write a detailed scene for the following.\n\n\
                 Scene Goal: {goal}\n\
                 Plot Context: {outline_excerpt}\n\
                 World Notes: {world}\n\
                 Character Notes: {characters}\n\
                 {memory}{canon}{feedback}{revision}\n\
                 Write a vivid, engaging scene with:\n\
                 - Clear setting and atmosphere\n\
                 - Natural dialogue\n\
                 - Character actions and reactions\n\
                 - Sensory details\n"
            )
        })
        .await?;

        remember(&self.ctx, "Scene generated", &output.text).await;
        Ok(output)
    }
}
