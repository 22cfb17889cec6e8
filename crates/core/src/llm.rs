//! Streaming response generation.

use crate::error::{Collaborator, SessionError};
use crate::session::{Speaker, TranscriptEntry};
use crate::tools::ToolDescriptor;
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionMessageToolCallChunk,
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionTool, ChatCompletionToolArgs,
        ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Provider-assigned call id; results are matched back by it.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    ToolCallRequest(ToolCallRequest),
    /// The model has nothing more to say for this round.
    Done,
}

/// A tool call together with the payload that was fed back for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedToolCall {
    pub request: ToolCallRequest,
    pub payload: Value,
}

/// One finished round of a generation that ended in tool calls.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolExchange {
    /// Text the model produced before requesting the tools.
    pub assistant_text: String,
    pub calls: Vec<ResolvedToolCall>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system_prompt: Option<String>,
    pub history: Vec<TranscriptEntry>,
    pub tools: Vec<ToolDescriptor>,
    /// Earlier rounds of the same generation, oldest first.
    pub exchanges: Vec<ToolExchange>,
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<GenerationEvent, SessionError>> + Send>>;

/// Dropping the returned stream cancels the underlying call.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, SessionError>;
}

/// [`ResponseGenerator`] for any OpenAI-compatible chat completions API.
pub struct OpenAiCompatibleGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompatibleGenerator {
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the provider.
    /// * `model` - Chat model identifier (e.g. "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

fn transport(e: OpenAIError) -> SessionError {
    SessionError::transport(Collaborator::ResponseGenerator, e.to_string())
}

/// Lays out system prompt, transcript history and prior tool rounds as chat messages.
pub fn build_messages(request: &GenerationRequest) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
    if let Some(prompt) = &request.system_prompt {
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(prompt.clone())
                .build()?
                .into(),
        );
    }
    for entry in &request.history {
        match entry.speaker {
            Speaker::User => messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(entry.text.clone())
                    .build()?
                    .into(),
            ),
            Speaker::Agent => messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(entry.text.clone())
                    .build()?
                    .into(),
            ),
        }
    }
    for exchange in &request.exchanges {
        let tool_calls: Vec<ChatCompletionMessageToolCall> = exchange
            .calls
            .iter()
            .map(|call| ChatCompletionMessageToolCall {
                id: call.request.id.clone(),
                r#type: ChatCompletionToolType::Function,
                function: FunctionCall {
                    name: call.request.name.clone(),
                    arguments: call.request.arguments.to_string(),
                },
            })
            .collect();
        let mut assistant = ChatCompletionRequestAssistantMessageArgs::default();
        assistant.tool_calls(tool_calls);
        if !exchange.assistant_text.is_empty() {
            assistant.content(exchange.assistant_text.clone());
        }
        messages.push(assistant.build()?.into());
        for call in &exchange.calls {
            messages.push(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call.request.id.clone())
                    .content(call.payload.to_string())
                    .build()?
                    .into(),
            );
        }
    }
    Ok(messages)
}

fn build_tools(descriptors: &[ToolDescriptor]) -> Result<Vec<ChatCompletionTool>, OpenAIError> {
    descriptors
        .iter()
        .map(|d| {
            ChatCompletionToolArgs::default()
                .function(
                    FunctionObjectArgs::default()
                        .name(d.name.clone())
                        .description(d.description.clone())
                        .parameters(d.parameters.clone())
                        .build()?,
                )
                .build()
        })
        .collect()
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Reassembles tool calls that arrive split across stream chunks, keyed by
/// the chunk's index.
#[derive(Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, chunk: &ChatCompletionMessageToolCallChunk) {
        let call = self.calls.entry(chunk.index).or_default();
        if let Some(id) = &chunk.id {
            call.id = Some(id.clone());
        }
        if let Some(function) = &chunk.function {
            if let Some(name) = &function.name {
                call.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                call.arguments.push_str(arguments);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed calls in index order. Arguments that are not valid JSON are
    /// passed through as a string so schema validation can reject them.
    pub fn finish(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, call)| {
                let arguments = if call.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments))
                };
                ToolCallRequest {
                    id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                    name: call.name,
                    arguments,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiCompatibleGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, SessionError> {
        let messages = build_messages(&request).map_err(transport)?;
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages).stream(true);
        if !request.tools.is_empty() {
            args.tools(build_tools(&request.tools).map_err(transport)?)
                .tool_choice("auto");
        }
        let chat_request = args.build().map_err(transport)?;

        debug!(
            model = %self.model,
            history = request.history.len(),
            exchanges = request.exchanges.len(),
            "Requesting streaming completion"
        );
        let mut upstream = self
            .client
            .chat()
            .create_stream(chat_request)
            .await
            .map_err(transport)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut accumulator = ToolCallAccumulator::default();
            while let Some(item) = upstream.next().await {
                let response = match item {
                    Ok(response) => response,
                    Err(e) => {
                        let _ = tx.send(Err(transport(e))).await;
                        return;
                    }
                };
                for choice in &response.choices {
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty()
                            && tx.send(Ok(GenerationEvent::TextDelta(content.clone()))).await.is_err()
                        {
                            return;
                        }
                    }
                    if let Some(chunks) = &choice.delta.tool_calls {
                        for chunk in chunks {
                            accumulator.push(chunk);
                        }
                    }
                }
            }
            for call in accumulator.finish() {
                if call.name.is_empty() {
                    warn!(id = %call.id, "Dropping tool call without a function name.");
                    continue;
                }
                if tx.send(Ok(GenerationEvent::ToolCallRequest(call))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(GenerationEvent::Done)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
