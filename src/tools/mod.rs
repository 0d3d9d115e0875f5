pub mod executor;
pub mod registry;
pub mod schema;

pub use executor::{parse_and_execute_tool, ToolOutcome};
pub use registry::{ToolDescriptor, ToolError, ToolFn, ToolParameter, ToolRegistry};
pub use schema::{FunctionSchema, ParametersSchema, PropertySchema, ToolSchema};
