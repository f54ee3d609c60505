use async_trait::async_trait;
use sdk::errors::EngineResult;

use super::{generate, remember, Agent, AgentContext, AgentInput, AgentKind, AgentOutput};

/// Writes the world bible for an outline
pub struct Worldbuilder {
    ctx: AgentContext,
}

impl Worldbuilder {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Agent for Worldbuilder {
    fn kind(&self) -> AgentKind {
        AgentKind::Worldbuilder
    }

    fn context(&self) -> &AgentContext {
        &self.ctx
    }

    async fn run(&self, input: AgentInput) -> EngineResult<AgentOutput> {
        let AgentInput::World {
            outline,
            genre,
            tone,
            themes,
            setting,
        } = &input
        else {
            return Err(input.mismatch(self.kind()));
        };

        let query = format!("{} {}", genre, setting);
        let output = generate(&self.ctx, self.kind(), &query, 5, 0.8, |feedback, memory| {
            format!(
                "You are the Worldbuilder. Create a detailed world bible for the following story.\n\n\
                 Outline: {outline}\n\
                 Genre: {genre}\n\
                 Tone: {tone}\n\
                 Themes: {themes}\n\
                 Setting: {setting}\n\
                 {memory}{feedback}\n\
                 Provide a comprehensive world bible covering:\n\
                 - Geography and locations\n\
                 - History and timeline\n\
                 - Culture and society\n\
                 - Magic/technology systems (if applicable)\n\
                 - Key world rules and constraints\n"
            )
        })
        .await?;

        remember(&self.ctx, "World bible created", &output.text).await;
        Ok(output)
    }
}
