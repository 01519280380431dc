pub mod capability;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use capability::CapabilityRegistry;
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry, BUILTIN_PROVIDER};
pub use schema::{final_answer_schema_json, parallel_call_schema_json, tool_call_schema_json};
