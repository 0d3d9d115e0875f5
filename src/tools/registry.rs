//! 工具注册表
//!
//! 每个工具由名称、描述、按声明顺序排列的参数与异步可调用对象组成。
//! 按名注册，同名后注册者覆盖前者（保留原有位置）；执行时把 JSON 参数对象按声明顺序展开为位置参数。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::tools::schema::{PropertySchema, ToolSchema};

/// 工具可调用对象：接收按声明顺序排列的参数
pub type ToolFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool {0} not found")]
    NotFound(String),

    #[error("Invalid arguments for tool {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Missing required argument '{argument}' for tool {tool}")]
    MissingArgument { tool: String, argument: String },

    #[error("Tool {tool} failed: {source}")]
    Execution {
        tool: String,
        #[source]
        source: anyhow::Error,
    },
}

/// 参数声明：类型、描述、是否必填
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolParameter {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// 已注册工具
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    callable: ToolFn,
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    /// OpenAI function-calling 描述；required 为必填参数子集，保持声明顺序
    pub fn schema(&self) -> ToolSchema {
        let properties: IndexMap<String, PropertySchema> = self
            .parameters
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    PropertySchema {
                        kind: p.kind.clone(),
                        description: p.description.clone(),
                    },
                )
            })
            .collect();
        let required = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.clone())
            .collect();
        ToolSchema::function(&self.name, &self.description, properties, required)
    }

    /// 将参数对象按声明顺序展开为位置参数；缺失的可选参数填 null
    fn positional_args(&self, args: &Value) -> Result<Vec<Value>, ToolError> {
        let object = match args {
            Value::Object(map) => map,
            Value::Null => return self.positional_args(&Value::Object(Default::default())),
            other => {
                return Err(ToolError::InvalidArguments {
                    tool: self.name.clone(),
                    reason: format!("expected an object of named parameters, got {other}"),
                })
            }
        };
        self.parameters
            .iter()
            .map(|p| match object.get(&p.name) {
                Some(v) => Ok(v.clone()),
                None if p.required => Err(ToolError::MissingArgument {
                    tool: self.name.clone(),
                    argument: p.name.clone(),
                }),
                None => Ok(Value::Null),
            })
            .collect()
    }
}

/// 工具注册表：按名称存储，导出 schema 时保持注册顺序
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
    order: Vec<String>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名覆盖
    pub fn add<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameter>,
        func: F,
    ) where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let callable: ToolFn = Arc::new(move |args| func(args).boxed());
        let descriptor = ToolDescriptor {
            name: name.clone(),
            description: description.into(),
            parameters,
            callable,
        };
        if self.tools.insert(name.clone(), Arc::new(descriptor)).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema())
            .collect()
    }

    /// 执行工具：args 为参数名到值的对象
    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let positional = tool.positional_args(&args)?;
        (tool.callable)(positional)
            .await
            .map_err(|source| ToolError::Execution {
                tool: name.to_string(),
                source,
            })
    }
}
