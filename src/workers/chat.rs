use super::WorkerContext;
use crate::error::AppResult;
use crate::llm::LlmClient;
use crate::logging::LogLevel;
use crate::runner::{ChatConfig, TaskResult};

const STEPS: u32 = 2;

/// One chat completion through an existing tunnel.
pub async fn run(ctx: &WorkerContext, config: ChatConfig) -> AppResult<TaskResult> {
    let llm = &ctx.settings().llm;
    let client = LlmClient::for_local_port(config.local_port, llm.request_timeout())?;

    ctx.progress("Resolving model", 1, STEPS);
    let model = match config.model {
        Some(model) => model,
        None => match client.list_models().await {
            Ok(models) if !models.is_empty() => models[0].clone(),
            Ok(_) => llm.default_model.clone(),
            Err(e) => {
                ctx.log(
                    LogLevel::Warn,
                    format!("Model listing failed ({}), using {}", e, llm.default_model),
                );
                llm.default_model.clone()
            }
        },
    };

    ctx.progress(format!("Waiting for {}", model), 2, STEPS);
    let max_tokens = config.max_tokens.or(Some(llm.max_tokens));
    let reply = ctx
        .guard(
            llm.request_timeout(),
            "chat completion",
            client.chat(&model, &config.messages, max_tokens),
        )
        .await?;

    if reply.content.trim().is_empty() {
        ctx.log(LogLevel::Warn, format!("{} returned an empty reply", reply.model));
    }
    Ok(TaskResult::Chat(reply))
}
