//! Steps backed by an inference dependency.
//!
//! An [`InferenceStep`] renders a prompt template against the cycle context,
//! invokes the dependency once, and returns the reply as text or parsed JSON.
//!
//! # Template placeholders
//! - `{cycle}`: the cycle number
//! - `{mode}`: the health mode the cycle started in
//! - `{input:NAME}`: the result published by step `NAME` this cycle

use super::{CycleContext, Step, StepOperation};
use crate::providers::{ChatMessage, InferenceDependency, InferenceRequest};
use anyhow::Context;
use async_trait::async_trait;
use cadence_core::{Priority, ResultKind};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Substituted for `{input:NAME}` when no such result was published.
const MISSING_INPUT: &str = "(none)";

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// How the reply is turned into a step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// The reply text as a JSON string
    #[default]
    Text,

    /// The reply parsed as JSON; unparseable replies fail the step
    Json,
}

/// A step operation that calls an inference dependency once.
pub struct InferenceStep {
    dependency: Arc<dyn InferenceDependency>,
    system_prompt: String,
    template: String,
    max_tokens: u32,
    temperature: f32,
    format: ResponseFormat,
}

impl InferenceStep {
    pub fn new(dependency: Arc<dyn InferenceDependency>, template: impl Into<String>) -> Self {
        Self {
            dependency,
            system_prompt: String::new(),
            template: template.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.0,
            format: ResponseFormat::Text,
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    /// Wrap into a [`Step`] routed through this dependency's breaker.
    pub fn into_step(self, name: impl Into<String>, priority: Priority, timeout: Duration) -> Step {
        let dependency = self.dependency.name().to_string();
        let kind = match self.format {
            ResponseFormat::Text => ResultKind::Text,
            ResponseFormat::Json => ResultKind::Record,
        };
        Step::new(name, priority, timeout, Arc::new(self))
            .dependency(dependency)
            .kind(kind)
    }

    /// Fill the template from the cycle context.
    pub fn render(&self, ctx: &CycleContext) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return out;
            };

            let key = &after[..close];
            match key {
                "cycle" => out.push_str(&ctx.cycle().to_string()),
                "mode" => out.push_str(ctx.mode().as_str()),
                _ => match key.strip_prefix("input:") {
                    Some(name) => out.push_str(&render_input(ctx.result(name))),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                },
            }
            rest = &after[close + 1..];
        }

        out.push_str(rest);
        out
    }

    fn request(&self, prompt: String) -> InferenceRequest {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.push(ChatMessage::user(prompt));

        InferenceRequest {
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

fn render_input(value: Option<Value>) -> String {
    match value {
        None => MISSING_INPUT.to_string(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// Strip a markdown code fence some models wrap JSON replies in.
fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    // Drop a language tag on the opening line
    match body.find('\n') {
        Some(newline) if !body[..newline].contains(['{', '[']) => body[newline + 1..].trim(),
        _ => body.trim(),
    }
}

#[async_trait]
impl StepOperation for InferenceStep {
    async fn run(&self, ctx: Arc<CycleContext>) -> anyhow::Result<Value> {
        let prompt = self.render(&ctx);
        let request = self.request(prompt);

        let response = self
            .dependency
            .invoke(request)
            .await
            .with_context(|| format!("inference dependency '{}' failed", self.dependency.name()))?;

        tracing::debug!(
            dependency = %self.dependency.name(),
            model = %response.model,
            chars = response.content.len(),
            "Inference reply received"
        );

        match self.format {
            ResponseFormat::Text => Ok(Value::String(response.content)),
            ResponseFormat::Json => serde_json::from_str(strip_fence(&response.content))
                .context("inference reply is not valid JSON"),
        }
    }
}
