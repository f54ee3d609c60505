use async_trait::async_trait;
use sdk::errors::EngineResult;

use super::{generate, remember, Agent, AgentContext, AgentInput, AgentKind, AgentOutput};

/// Polishes prose without changing events
pub struct EditorAgent {
    ctx: AgentContext,
}

impl EditorAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for EditorAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::EditorAgent
    }

    fn context(&self) -> &AgentContext {
        &self.ctx
    }

    async fn run(&self, input: AgentInput) -> EngineResult<AgentOutput> {
        let AgentInput::Edit { scene, notes } = &input else {
            return Err(input.mismatch(self.kind()));
        };

        let output = generate(
            &self.ctx,
            self.kind(),
            "writing style editing",
            3,
            0.7,
            |feedback, memory| {
                format!(
                    "You are the Editor Agent. Polish and improve the following scene.\n\n\
                     Scene: {scene}\n\
                     Notes: {notes}\n\
                     {memory}{feedback}\n\
                     Improve:\n\
                     - Prose clarity and flow\n\
                     - Dialogue naturalness\n\
                     - Descriptive language\n\
                     - Grammar and style\n\
                     - Pacing\n\n\
                     Maintain:\n\
                     - Original plot and events\n\
                     - Character voices\n\
                     - Scene structure\n\n\
                     Provide the polished scene.\n"
                )
            },
        )
        .await?;

        remember(&self.ctx, "Scene edited", &output.text).await;
        Ok(output)
    }
}
