/// Built-in node implementations
///
/// Registered at startup so JSON graphs can use them by id:
/// - `log`: write a message to the trace log
/// - `set`: merge its params into State
/// - `delay`: sleep for a number of milliseconds
/// - `lua`: run an embedded Lua script using mlua
/// - `http`: outbound HTTP request using reqwest
/// - `wait_for_input`: suspend the run until resumed with external data

use crate::error::EngineResult;
use crate::runtime::context::NodeContext;
use crate::workflow::registry::NodeRegistry;
use crate::workflow::types::{NodeDefinition, NodeImplementation, NodeOutput, ERROR_EDGE};
use anyhow::Result;
use async_trait::async_trait;
use mlua::LuaSerdeExt;
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Register every built-in node on `registry`
pub fn register_builtin_nodes(registry: &NodeRegistry) -> EngineResult<()> {
    registry.register(
        NodeDefinition::new("log")
            .name("Log")
            .description("Write a message to the run log")
            .category("utility")
            .input("message", "Text to log; defaults to the node input", false)
            .implementation(Arc::new(LogNode)),
    )?;
    registry.register(
        NodeDefinition::new("set")
            .name("Set State")
            .description("Merge the params object into State")
            .category("state")
            .implementation(Arc::new(SetNode)),
    )?;
    registry.register(
        NodeDefinition::new("delay")
            .name("Delay")
            .description("Sleep before continuing")
            .category("timing")
            .input("ms", "Milliseconds to wait", true)
            .implementation(Arc::new(DelayNode)),
    )?;
    registry.register(
        NodeDefinition::new("lua")
            .name("Lua Script")
            .description("Evaluate a Lua script with params, input and state in scope")
            .category("logic")
            .input("script", "Lua chunk returning the node output", true)
            .edges([ERROR_EDGE])
            .implementation(Arc::new(LuaNode)),
    )?;
    registry.register(
        NodeDefinition::new("http")
            .name("HTTP Request")
            .description("Send an HTTP request and store the response")
            .category("network")
            .input("url", "Request url", true)
            .input("method", "GET, POST, PUT, DELETE or PATCH", false)
            .output("response", "status, headers, data and success flag")
            .edges([ERROR_EDGE])
            .implementation(Arc::new(HttpNode::new())),
    )?;
    registry.register(
        NodeDefinition::new("wait_for_input")
            .name("Wait For Input")
            .description("Suspend the run until the pause is resumed")
            .category("suspension")
            .input("pauseId", "Pause id; defaults to '<flowInstanceId>:<nodeId>'", false)
            .input("details", "Shown to whoever resumes the pause", false)
            .output("input", "Resume payload (key configurable with 'as')")
            .implementation(Arc::new(WaitForInputNode)),
    )?;

    tracing::info!("📦 Registered {} built-in nodes", registry.len());
    Ok(())
}

fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub struct LogNode;

#[async_trait]
impl NodeImplementation for LogNode {
    async fn invoke(&self, params: Value, ctx: NodeContext) -> Result<NodeOutput> {
        let message = match params {
            Value::String(s) => s,
            Value::Object(ref map) if map.contains_key("message") => match &map["message"] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Value::Null => ctx.input().to_string(),
            other => other.to_string(),
        };
        tracing::info!("📝 [{}] {}: {}", ctx.flow_instance_id(), ctx.node_id(), message);
        Ok(NodeOutput::Value(Value::String(message)))
    }
}

pub struct SetNode;

#[async_trait]
impl NodeImplementation for SetNode {
    async fn invoke(&self, params: Value, _ctx: NodeContext) -> Result<NodeOutput> {
        match params {
            Value::Object(map) => Ok(NodeOutput::Value(Value::Object(map))),
            Value::Null => Ok(NodeOutput::Value(Value::Object(Map::new()))),
            other => Err(anyhow::anyhow!("set expects an object of keys to merge, got {}", other)),
        }
    }
}

pub struct DelayNode;

#[async_trait]
impl NodeImplementation for DelayNode {
    async fn invoke(&self, params: Value, ctx: NodeContext) -> Result<NodeOutput> {
        let ms = params
            .as_u64()
            .or_else(|| params.get("ms").and_then(|v| v.as_u64()))
            .ok_or_else(|| anyhow::anyhow!("delay missing 'ms' parameter"))?;
        tracing::debug!("⏳ Delaying run {} for {}ms", ctx.flow_instance_id(), ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(NodeOutput::Value(ctx.input().clone()))
    }
}

pub struct LuaNode;

impl LuaNode {
    /// Evaluate synchronously; the Lua VM never lives across an await point
    fn evaluate(script: &str, params: &Value, input: &Value, state: &Map<String, Value>) -> Result<Value> {
        let lua = mlua::Lua::new();
        let globals = lua.globals();

        // Remove dangerous globals (ignore errors)
        let _ = globals.set("os", mlua::Nil);
        let _ = globals.set("io", mlua::Nil);
        let _ = globals.set("debug", mlua::Nil);
        let _ = globals.set("package", mlua::Nil);
        let _ = globals.set("dofile", mlua::Nil);
        let _ = globals.set("loadfile", mlua::Nil);

        for (name, value) in [("params", params), ("input", input)] {
            let value = lua
                .to_value(value)
                .map_err(|e| anyhow::anyhow!("Failed to expose '{}' to Lua: {}", name, e))?;
            globals
                .set(name, value)
                .map_err(|e| anyhow::anyhow!("Failed to set Lua global '{}': {}", name, e))?;
        }
        let state = lua
            .to_value(state)
            .map_err(|e| anyhow::anyhow!("Failed to expose state to Lua: {}", e))?;
        globals
            .set("state", state)
            .map_err(|e| anyhow::anyhow!("Failed to set Lua global 'state': {}", e))?;

        let result: mlua::Value = lua
            .load(script)
            .eval()
            .map_err(|e| anyhow::anyhow!("Lua script execution failed: {}", e))?;

        lua.from_value(result)
            .map_err(|e| anyhow::anyhow!("Lua result is not JSON-representable: {}", e))
    }
}

#[async_trait]
impl NodeImplementation for LuaNode {
    async fn invoke(&self, params: Value, ctx: NodeContext) -> Result<NodeOutput> {
        let script = param_str(&params, "script")
            .ok_or_else(|| anyhow::anyhow!("lua missing 'script' parameter"))?
            .to_string();
        let args = params.get("params").cloned().unwrap_or(Value::Null);
        tracing::debug!("🏃 Executing Lua script for node '{}'", ctx.node_id());

        let output = Self::evaluate(&script, &args, ctx.input(), &ctx.state_snapshot())?;
        Ok(NodeOutput::Value(output))
    }
}

pub struct HttpNode {
    client: reqwest::Client,
}

impl HttpNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeImplementation for HttpNode {
    async fn invoke(&self, params: Value, ctx: NodeContext) -> Result<NodeOutput> {
        let url = param_str(&params, "url").ok_or_else(|| anyhow::anyhow!("http missing 'url' parameter"))?;
        let method = param_str(&params, "method").unwrap_or("GET").to_uppercase();
        let target_key = param_str(&params, "as").unwrap_or("response").to_string();

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            _ => return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method)),
        };

        if let Some(headers) = params.get("headers").and_then(|h| h.as_object()) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }

        // Explicit body wins; otherwise the node input is sent for write methods
        let body = params
            .get("body")
            .cloned()
            .or_else(|| matches!(method.as_str(), "POST" | "PUT" | "PATCH").then(|| ctx.input().clone()))
            .filter(|body| !body.is_null());
        match body {
            Some(Value::String(text)) => request = request.header("Content-Type", "text/plain").body(text),
            Some(body) => request = request.json(&body),
            None => {}
        }

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {}", e))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);

        let mut output = Map::new();
        output.insert(
            target_key,
            json!({
                "status": status.as_u16(),
                "headers": headers,
                "data": data,
                "success": status.is_success()
            }),
        );
        Ok(NodeOutput::Value(Value::Object(output)))
    }
}

pub struct WaitForInputNode;

#[async_trait]
impl NodeImplementation for WaitForInputNode {
    async fn invoke(&self, params: Value, ctx: NodeContext) -> Result<NodeOutput> {
        let pause_id = param_str(&params, "pauseId")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", ctx.flow_instance_id(), ctx.node_id()));
        let details = params.get("details").cloned().unwrap_or(Value::Null);
        let target_key = param_str(&params, "as").unwrap_or("input").to_string();

        let data = ctx.request_pause(pause_id, details).await?;

        let mut output = Map::new();
        output.insert(target_key, data);
        Ok(NodeOutput::Value(Value::Object(output)))
    }
}
