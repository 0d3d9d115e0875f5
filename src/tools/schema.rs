//! 工具 Schema 导出：OpenAI function-calling 格式
//!
//! `{"type": "function", "function": {"name", "description", "parameters": {"type": "object", "properties", "required"}}}`

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 单个参数的属性描述
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParametersSchema {
    #[serde(rename = "type")]
    pub kind: String,
    /// 按参数声明顺序序列化
    pub properties: IndexMap<String, PropertySchema>,
    /// 必填参数，按声明顺序
    pub required: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: ParametersSchema,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSchema,
}

impl ToolSchema {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: IndexMap<String, PropertySchema>,
        required: Vec<String>,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSchema {
                name: name.into(),
                description: description.into(),
                parameters: ParametersSchema {
                    kind: "object".to_string(),
                    properties,
                    required,
                },
            },
        }
    }
}
