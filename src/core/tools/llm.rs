//! `llm.*` primitives: one-shot prompts against the running agent's model
//! that ask for a JSON object back.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

use super::{Tool, ToolContext, ToolTableBuilder, error_result, str_arg};
use crate::core::error::ToolError;
use crate::core::llm::{Response, ToolChoice};
use crate::core::memory::Message;

type PromptBuilder = fn(&Value) -> Result<Prompt, String>;

struct Prompt {
    system: String,
    user: String,
}

pub struct LlmPrimitive {
    name: &'static str,
    build: PromptBuilder,
}

const PRIMITIVES: &[(&str, PromptBuilder)] = &[
    ("llm.analyze_sentiment", analyze_sentiment),
    ("llm.classify_text", classify_text),
    ("llm.moderate_content", moderate_content),
    ("llm.score_quality", score_quality),
    ("llm.summarize_text", summarize_text),
    ("llm.rewrite_text", rewrite_text),
    ("llm.generate_tags", generate_tags),
    ("llm.generate_title", generate_title),
    ("llm.evaluate_condition", evaluate_condition),
    ("llm.rank_items", rank_items),
    ("llm.recommend_action", recommend_action),
    ("llm.extract_entities", extract_entities),
    ("llm.extract_structured_data", extract_structured_data),
];

pub(super) fn register(builder: ToolTableBuilder) -> ToolTableBuilder {
    PRIMITIVES.iter().fold(builder, |builder, &(name, build)| {
        builder.register(name, Arc::new(LlmPrimitive { name, build }))
    })
}

#[async_trait]
impl Tool for LlmPrimitive {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<String, ToolError> {
        let prompt = match (self.build)(&args) {
            Ok(prompt) => prompt,
            Err(msg) => return Ok(error_result(msg)),
        };
        let messages = [Message::system(prompt.system), Message::user(prompt.user)];

        let content = match ctx.completer.chat(&messages, &[], &ToolChoice::None).await {
            Ok(Response::Text { content }) => content,
            Ok(Response::ToolCall(call)) => {
                return Ok(error_result(format!(
                    "model answered with a tool call ({}) instead of JSON",
                    call.name
                )));
            }
            Err(e) => {
                warn!(function = self.name, agent_id = %ctx.agent_id, "LLM primitive failed: {}", e);
                return Ok(error_result(e.to_string()));
            }
        };
        Ok(shape_answer(&content))
    }
}

/// Parsed objects gain `"status":"success"`; anything else is passed back raw.
fn shape_answer(content: &str) -> String {
    let trimmed = strip_code_fence(content.trim());
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(mut map)) => {
            map.insert("status".to_string(), json!("success"));
            Value::Object(map).to_string()
        }
        _ => json!({ "status": "success", "raw_response": content }).to_string(),
    }
}

fn strip_code_fence(s: &str) -> &str {
    s.strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(s)
}

fn require_text(args: &Value) -> Result<&str, String> {
    str_arg(args, "text").ok_or_else(|| "missing required parameter: text".to_string())
}

fn string_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn positive_number(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_f64).filter(|n| *n > 0.0).map(|n| n as u64)
}

fn analyze_sentiment(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    Ok(Prompt {
        system: "You are a sentiment analyzer. Analyze the sentiment of the given text and respond with ONLY a JSON object in this exact format:\n{\"sentiment\": \"positive|negative|neutral\", \"confidence\": 0.0-1.0, \"explanation\": \"brief reason\"}".to_string(),
        user: format!("Analyze the sentiment of: {}", text),
    })
}

fn classify_text(args: &Value) -> Result<Prompt, String> {
    let categories = string_list(args, "categories");
    let text = str_arg(args, "text")
        .filter(|_| !categories.is_empty())
        .ok_or_else(|| "missing required parameters: text and categories".to_string())?;
    Ok(Prompt {
        system: format!(
            "You are a text classifier. Classify the given text into one of these categories: {}.\nRespond with ONLY a JSON object: {{\"category\": \"chosen_category\", \"confidence\": 0.0-1.0, \"reasoning\": \"brief explanation\"}}",
            categories.join(", ")
        ),
        user: format!("Classify this text: {}", text),
    })
}

fn moderate_content(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    Ok(Prompt {
        system: "You are a content moderator. Check the text for inappropriate content, spam, harassment, hate speech, or policy violations.\nRespond with ONLY a JSON object: {\"safe\": true/false, \"issues\": [\"list\", \"of\", \"issues\"], \"severity\": \"none|low|medium|high\", \"explanation\": \"brief description\"}".to_string(),
        user: format!("Moderate this content: {}", text),
    })
}

fn score_quality(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    let criteria = string_list(args, "criteria");
    let criteria = if criteria.is_empty() {
        "clarity, coherence, grammar, relevance, and completeness".to_string()
    } else {
        criteria.join(", ")
    };
    Ok(Prompt {
        system: format!(
            "You are a text quality evaluator. Rate the text quality based on: {}.\nRespond with ONLY a JSON object: {{\"score\": 0-100, \"breakdown\": {{\"criterion\": score}}, \"feedback\": \"improvement suggestions\"}}",
            criteria
        ),
        user: format!("Rate the quality of: {}", text),
    })
}

fn summarize_text(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    let style = str_arg(args, "style").unwrap_or("paragraph");
    let length = positive_number(args, "max_length")
        .map(|n| format!(" Keep it under {} words.", n))
        .unwrap_or_default();
    Ok(Prompt {
        system: format!(
            "You are a text summarizer. Create a concise summary in {} format.{}\nRespond with ONLY a JSON object: {{\"summary\": \"the summary text\", \"key_points\": [\"main\", \"points\"], \"word_count\": number}}",
            style, length
        ),
        user: format!("Summarize this text: {}", text),
    })
}

fn rewrite_text(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    let instructions: Vec<String> = [("tone", "tone"), ("style", "style"), ("audience", "target audience")]
        .iter()
        .filter_map(|(key, label)| str_arg(args, key).map(|v| format!("{}: {}", label, v)))
        .collect();
    let instructions = if instructions.is_empty() {
        "maintaining the original meaning".to_string()
    } else {
        instructions.join(", ")
    };
    Ok(Prompt {
        system: format!(
            "You are a text rewriter. Rewrite the text with: {}.\nRespond with ONLY a JSON object: {{\"rewritten_text\": \"the new text\", \"changes_made\": [\"list\", \"of\", \"changes\"], \"improvement_score\": 0-10}}",
            instructions
        ),
        user: format!("Rewrite this text: {}", text),
    })
}

fn generate_tags(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    let limit = positive_number(args, "max_tags").unwrap_or(10);
    Ok(Prompt {
        system: format!(
            "You are a tag generator. Extract up to {} relevant tags/keywords from the text.\nRespond with ONLY a JSON object: {{\"tags\": [\"tag1\", \"tag2\"], \"categories\": [\"main\", \"categories\"], \"relevance_scores\": {{\"tag\": 0.0-1.0}}}}",
            limit
        ),
        user: format!("Generate tags for: {}", text),
    })
}

fn generate_title(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    let style = str_arg(args, "style").unwrap_or("engaging and informative");
    let length = positive_number(args, "max_length")
        .map(|n| format!(" Maximum {} characters.", n))
        .unwrap_or_default();
    Ok(Prompt {
        system: format!(
            "You are a title generator. Create a {} title.{}\nRespond with ONLY a JSON object: {{\"title\": \"main title\", \"alternatives\": [\"alt1\", \"alt2\"], \"subtitle\": \"optional subtitle\"}}",
            style, length
        ),
        user: format!("Generate a title for: {}", text),
    })
}

fn evaluate_condition(args: &Value) -> Result<Prompt, String> {
    let (Some(text), Some(condition)) = (str_arg(args, "text"), str_arg(args, "condition")) else {
        return Err("missing required parameters: text and condition".to_string());
    };
    Ok(Prompt {
        system: "You are a condition evaluator. Evaluate if the given text meets the specified condition.\nRespond with ONLY a JSON object: {\"result\": true/false, \"confidence\": 0.0-1.0, \"reasoning\": \"explanation\", \"evidence\": [\"supporting\", \"facts\"]}".to_string(),
        user: format!("Text: {}\n\nCondition to evaluate: {}", text, condition),
    })
}

fn rank_items(args: &Value) -> Result<Prompt, String> {
    let items = args
        .get("items")
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty());
    let (Some(items), Some(criteria)) = (items, str_arg(args, "criteria")) else {
        return Err("missing required parameters: items and criteria".to_string());
    };
    Ok(Prompt {
        system: "You are a ranking system. Rank the given items based on the specified criteria.\nRespond with ONLY a JSON object: {\"ranked_items\": [ordered_list], \"scores\": {\"item\": score}, \"reasoning\": {\"item\": \"why ranked here\"}}".to_string(),
        user: format!(
            "Items to rank: {}\n\nRanking criteria: {}",
            Value::Array(items.clone()),
            criteria
        ),
    })
}

fn recommend_action(args: &Value) -> Result<Prompt, String> {
    let actions = string_list(args, "actions");
    let context = str_arg(args, "context")
        .filter(|_| !actions.is_empty())
        .ok_or_else(|| "missing required parameters: context and actions".to_string())?;
    let goal = str_arg(args, "goal")
        .map(|g| format!(" Goal: {}", g))
        .unwrap_or_default();
    Ok(Prompt {
        system: "You are an action recommender. Based on the context, recommend the best action from the available options.\nRespond with ONLY a JSON object: {\"recommended_action\": \"chosen_action\", \"confidence\": 0.0-1.0, \"reasoning\": \"why this action\", \"risks\": [\"potential\", \"issues\"], \"alternatives\": [\"other\", \"viable\", \"options\"]}".to_string(),
        user: format!(
            "Context: {}\n\nAvailable actions: {}{}",
            context,
            actions.join(", "),
            goal
        ),
    })
}

fn extract_entities(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    let types = string_list(args, "entity_types");
    let types = if types.is_empty() {
        "all entity types (persons, locations, dates, organizations, products, etc.)".to_string()
    } else {
        types.join(", ")
    };
    Ok(Prompt {
        system: format!(
            "You are an entity extractor. Extract {} from the text.\nRespond with ONLY a JSON object: {{\"entities\": {{\"type\": [\"entity1\", \"entity2\"]}}, \"relationships\": [{{\"from\": \"entity1\", \"to\": \"entity2\", \"type\": \"relation\"}}], \"count\": number_of_entities}}",
            types
        ),
        user: format!("Extract entities from: {}", text),
    })
}

fn extract_structured_data(args: &Value) -> Result<Prompt, String> {
    let text = require_text(args)?;
    let shape = match args.get("schema") {
        Some(schema @ Value::Object(_)) => format!("this exact schema: {}", schema),
        _ => "appropriate structured format".to_string(),
    };
    Ok(Prompt {
        system: format!(
            "You are a data extractor. Convert the unstructured text into {}.\nRespond with ONLY a JSON object containing the extracted structured data. Include a \"_metadata\" field with extraction confidence and any issues.",
            shape
        ),
        user: format!("Extract structured data from: {}", text),
    })
}
