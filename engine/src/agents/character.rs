use async_trait::async_trait;
use sdk::errors::EngineResult;

use super::{
    generate, remember, truncate_chars, Agent, AgentContext, AgentInput, AgentKind, AgentOutput,
};

/// Builds character profiles from the outline and world notes
pub struct CharacterAgent {
    ctx: AgentContext,
}

impl CharacterAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for CharacterAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::CharacterAgent
    }

    fn context(&self) -> &AgentContext {
        &self.ctx
    }

    async fn run(&self, input: AgentInput) -> EngineResult<AgentOutput> {
        let AgentInput::Characters { outline, world } = &input else {
            return Err(input.mismatch(self.kind()));
        };

        let query = truncate_chars(outline, 200);
        let output = generate(&self.ctx, self.kind(), &query, 5, 0.8, |feedback, memory| {
            format!(
                "You are the Character Agent. Create detailed character profiles for the following story.\n\n\
                 Outline: {outline}\n\
                 World Notes: {world}\n\
                 {memory}{feedback}\n\
                 For each major character, provide:\n\
                 - Name and role\n\
                 - Physical description\n\
                 - Personality traits\n\
                 - Backstory and motivations\n\
                 - Character arc\n\
                 - Key relationships\n\
                 - Unique quirks or flaws\n"
            )
        })
        .await?;

        remember(&self.ctx, "Character bible created", &output.text).await;
        Ok(output)
    }
}
