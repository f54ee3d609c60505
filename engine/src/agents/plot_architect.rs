use async_trait::async_trait;
use sdk::errors::{EngineError, EngineResult};

use super::{generate, remember, Agent, AgentContext, AgentInput, AgentKind, AgentOutput};

/// Turns a story idea into a three-act outline
pub struct PlotArchitect {
    ctx: AgentContext,
}

impl PlotArchitect {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for PlotArchitect {
    fn kind(&self) -> AgentKind {
        AgentKind::PlotArchitect
    }

    fn context(&self) -> &AgentContext {
        &self.ctx
    }

    async fn run(&self, input: AgentInput) -> EngineResult<AgentOutput> {
        let AgentInput::Plot {
            idea,
            genre,
            tone,
            themes,
            setting,
        } = &input
        else {
            return Err(input.mismatch(self.kind()));
        };
        if idea.trim().is_empty() {
            return Err(EngineError::Validation("idea must not be empty".into()));
        }

        let output = generate(&self.ctx, self.kind(), idea, 5, 0.8, |feedback, memory| {
            format!(
                "You are the Plot Architect. Create a 3-act outline for the following story idea.\n\n\
                 Idea: {idea}\n\
                 Genre: {genre}\n\
                 Tone: {tone}\n\
                 Themes: {themes}\n\
                 Setting: {setting}\n\
                 {memory}{feedback}\n\
                 Provide a structured 3-act outline with clear turning points.\n\
                 Format:\n\
                 ACT 1: Setup\n\
                 - [Opening scene/hook]\n\
                 - [Inciting incident]\n\
                 - [First act turning point]\n\n\
                 ACT 2: Confrontation\n\
                 - [Rising action]\n\
                 - [Midpoint twist]\n\
                 - [Second act turning point]\n\n\
                 ACT 3: Resolution\n\
                 - [Climax]\n\
                 - [Falling action]\n\
                 - [Resolution]\n"
            )
        })
        .await?;

        remember(&self.ctx, "Plot outline created", &output.text).await;
        Ok(output)
    }
}
