//! Model collaborator: the conversation a run builds, the provider trait, and an
//! OpenAI-compatible provider.
//!
//! The loop never formats model-facing text itself. Every recorded [`Step`]
//! becomes exactly one tool-result message through [`ChatMessage::for_step`],
//! so executed, failed, suppressed and abandoned calls all reach the model.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionCall,
        FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use proto::{LlmError, Role, Step, StepOutcome, ToolCall, ToolDefinition};
use serde_json::Value;
use tools::PageState;
use tracing::debug;

/// Longest tool output shown to the model, in characters.
pub const MAX_TOOL_RESULT_CHARS: usize = 16_000;

/// One message of a run's conversation
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Id of the call this message answers (tool results only).
    pub tool_call_id: Option<String>,
    /// Calls the model planned (assistant messages only).
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    /// Assistant turn that queued `calls`.
    pub fn planned(calls: &[ToolCall]) -> Self {
        Self {
            tool_calls: Some(calls.to_vec()),
            ..Self::new(Role::Assistant, "")
        }
    }

    /// Opening message: the task and the page it starts from.
    pub fn task(task: &str, page: &PageState) -> Self {
        Self::user(format!("Task: {task}\n\n{}", page.summarize()))
    }

    /// Per-round context: operator notes first, then the current page.
    pub fn observation(notes: &[String], page: &PageState) -> Self {
        let mut content = String::new();
        for note in notes {
            content.push_str(note);
            content.push('\n');
        }
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&page.summarize());
        Self::user(content)
    }

    /// Answers the model call a step recorded.
    pub fn for_step(step: &Step) -> Self {
        let content = match &step.outcome {
            StepOutcome::Succeeded { output } => truncate_output(output, MAX_TOOL_RESULT_CHARS),
            StepOutcome::Failed { error } => {
                format!("Error: {}", truncate_output(error, MAX_TOOL_RESULT_CHARS))
            }
            StepOutcome::Suppressed { by_sequence } => format!(
                "Not executed: the human operator already acted on {} (step {by_sequence}).",
                step.target_key
            ),
            StepOutcome::Abandoned => "Not executed: the run was cancelled.".to_string(),
        };
        Self::tool_result(&step.call_id, content)
    }
}

/// Operator note for a human step, reported with the next observation.
pub fn human_step_note(step: &Step) -> String {
    let status = match &step.outcome {
        StepOutcome::Failed { error } => format!("it failed: {}", truncate_output(error, 500)),
        _ => "it succeeded".to_string(),
    };
    format!(
        "The human operator performed {} with arguments {} on {}; {status}. \
         This is authoritative for that target.",
        step.tool_name, step.arguments, step.target_key
    )
}

/// Truncates `output` to at most `max_chars` characters.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total_chars = output.chars().count();
    if total_chars <= max_chars {
        return output.to_string();
    }

    let kept = output.chars().take(max_chars).collect::<String>();
    let cut = total_chars - max_chars;
    format!("{kept}\n...[output truncated: {cut} chars omitted]")
}

/// Request to the LLM
#[derive(Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Catalog of the run's snapshot.
    pub tools: Vec<ToolDefinition>,
    pub model: String,
}

/// Token usage of one call, or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl std::fmt::Display for TokenUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tokens ({} prompt, {} completion)",
            self.total(),
            self.prompt_tokens,
            self.completion_tokens
        )
    }
}

/// Response from the LLM. No calls means the model considers the task done.
#[derive(Debug)]
pub enum ChatResponse {
    Text(String, TokenUsage),
    ToolCalls(Vec<ToolCall>, TokenUsage),
}

/// LLM provider trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// OpenAI-compatible provider (works with OpenAI, together.ai, Ollama, etc.)
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
        }
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: Client::with_config(config),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        let messages: Vec<ChatCompletionRequestMessage> = req
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<_, _>>()?;
        let tools: Vec<ChatCompletionTool> = req
            .tools
            .iter()
            .map(convert_tool)
            .collect::<Result<_, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&req.model).messages(messages);
        if !tools.is_empty() {
            builder.tools(tools);
        }
        let request = builder
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?;

        debug!(
            model = %req.model,
            messages = req.messages.len(),
            tools = req.tools.len(),
            "Sending request to OpenAI"
        );

        let response = self.client.chat().create(request).await.map_err(|e| {
            let msg = e.to_string();
            debug!(error = %msg, "OpenAI API error");
            let hint = if msg.contains("does not exist") || msg.contains("model_not_found") {
                " Check the [agent] model setting."
            } else if msg.to_lowercase().contains("billing") || msg.to_lowercase().contains("quota")
            {
                " Check the provider account's billing."
            } else {
                ""
            };
            LlmError::Api(format!("{msg}{hint}"))
        })?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".into()))?;
        Ok(into_response(
            choice.message.tool_calls.unwrap_or_default(),
            choice.message.content,
            usage,
        ))
    }
}

/// Tool calls win over text whatever the finish reason; some compatible
/// servers report `stop` alongside calls.
fn into_response(
    tool_calls: Vec<ChatCompletionMessageToolCall>,
    content: Option<String>,
    usage: TokenUsage,
) -> ChatResponse {
    if tool_calls.is_empty() {
        return ChatResponse::Text(content.unwrap_or_default(), usage);
    }
    let calls = tool_calls
        .into_iter()
        .map(|tc| ToolCall {
            arguments: parse_tool_arguments(&tc.function.arguments),
            id: tc.id,
            name: tc.function.name,
        })
        .collect();
    ChatResponse::ToolCalls(calls, usage)
}

fn convert_message(m: &ChatMessage) -> Result<ChatCompletionRequestMessage, LlmError> {
    let ser = |e: async_openai::error::OpenAIError| LlmError::Serialization(e.to_string());
    match m.role {
        Role::System => Ok(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(ser)?,
        )),
        Role::User => Ok(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(ser)?,
        )),
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            builder.content(m.content.clone());
            if let Some(calls) = &m.tool_calls {
                builder.tool_calls(
                    calls
                        .iter()
                        .map(|tc| ChatCompletionMessageToolCall {
                            id: tc.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect::<Vec<_>>(),
                );
            }
            Ok(ChatCompletionRequestMessage::Assistant(
                builder.build().map_err(ser)?,
            ))
        }
        Role::Tool => {
            let call_id = m.tool_call_id.clone().ok_or_else(|| {
                LlmError::Serialization("tool result without a call id".to_string())
            })?;
            Ok(ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call_id)
                    .content(m.content.clone())
                    .build()
                    .map_err(ser)?,
            ))
        }
    }
}

fn convert_tool(t: &ToolDefinition) -> Result<ChatCompletionTool, LlmError> {
    Ok(ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObjectArgs::default()
            .name(t.name.clone())
            .description(t.description.clone())
            .parameters(t.parameters.clone())
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?,
    })
}

/// Malformed argument JSON becomes `{}` so schema validation reports it.
fn parse_tool_arguments(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or(Value::Object(Default::default()))
}
