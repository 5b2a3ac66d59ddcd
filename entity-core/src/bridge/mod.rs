//! Tool-call bridge between the server-side tool loop and the browser tab
//! that owns the form state.
//!
//! Server: `register_frontend_tools` installs proxies that park each call in
//! `PendingToolCalls` under a wait id and emit a `frontend-tool-request`.
//! Client: `FrontendToolInterceptor` runs the tool against the mounted
//! `ViewController` and posts a `ToolResultPayload`, which the server hands
//! back to `PendingToolCalls`.

mod controller;
mod pending;
mod tools;
mod transport;

pub use controller::{BridgeHandle, FieldInfo, FrontendToolExecutor, MountGuard, ViewController};
pub use pending::{PendingCall, PendingToolCalls};
pub use tools::{
    FRONTEND_TOOLS, GetValuesInput, NoInput, RECORD_GET_FIELD_INFO, RECORD_GET_VALUES,
    RECORD_RESET_FORM, RECORD_SET_VALUES, RECORD_VALIDATE_FORM, SetValuesInput,
    frontend_tool_definitions, is_frontend_tool, register_frontend_tools,
};
pub use transport::{FrontendToolInterceptor, ToolResultClient, ToolResultPayload};

#[cfg(test)]
pub(crate) use controller::tests::TestForm;
