//! Client side of the bridge: the mounted view and the tools that run against it

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::tools::{
    GetValuesInput, RECORD_GET_FIELD_INFO, RECORD_GET_VALUES, RECORD_RESET_FORM,
    RECORD_SET_VALUES, RECORD_VALIDATE_FORM, SetValuesInput,
};
use crate::error::{EngineError, Result};
use crate::model::{FieldDefinition, FieldType, ValidationReport, Values};

/// One field as the live form renders it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
}

impl From<&FieldDefinition> for FieldInfo {
    fn from(field: &FieldDefinition) -> Self {
        FieldInfo {
            name: field.name.clone(),
            title: field.title.clone(),
            field_type: field.field_type,
            required: field.required,
            options: field.options.clone(),
        }
    }
}

/// In-memory form state of the view the user is looking at
#[async_trait]
pub trait ViewController: Send + Sync {
    /// Fields as currently rendered; may change while the form is open
    async fn field_info(&self) -> Vec<FieldInfo>;

    async fn get_values(&self) -> Values;

    async fn set_values(&self, values: Values);

    async fn reset(&self);

    async fn validate(&self) -> ValidationReport;
}

struct Mounted {
    token: u64,
    controller: Arc<dyn ViewController>,
}

/// Explicit handle to the active view.
///
/// A view mounts itself when it becomes active and keeps the guard for as long
/// as it is; a later mount replaces it.
#[derive(Clone, Default)]
pub struct BridgeHandle {
    mounted: Arc<Mutex<Option<Mounted>>>,
    next_token: Arc<AtomicU64>,
}

impl BridgeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Mounted>> {
        self.mounted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mount(&self, controller: Arc<dyn ViewController>) -> MountGuard {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        *self.slot() = Some(Mounted { token, controller });
        MountGuard {
            handle: self.clone(),
            token,
        }
    }

    pub fn current(&self) -> Option<Arc<dyn ViewController>> {
        self.slot().as_ref().map(|m| m.controller.clone())
    }

    pub fn is_mounted(&self) -> bool {
        self.slot().is_some()
    }
}

/// Unmounts its view on drop unless another view has mounted since
pub struct MountGuard {
    handle: BridgeHandle,
    token: u64,
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        let mut slot = self.handle.slot();
        if slot.as_ref().is_some_and(|m| m.token == self.token) {
            *slot = None;
        }
    }
}

/// Runs frontend tools against whichever view is mounted
#[derive(Clone)]
pub struct FrontendToolExecutor {
    bridge: BridgeHandle,
}

fn parse_input<T: serde::de::DeserializeOwned + Default>(tool: &str, input: Value) -> Result<T> {
    if input.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(input)
        .map_err(|e| EngineError::Validation(format!("invalid input for {}: {}", tool, e)))
}

/// Structured output for unknown field names, phrased so the model can retry
fn invalid_fields(invalid: Vec<String>, valid: Vec<String>, applied: Option<Vec<String>>) -> Value {
    let error = EngineError::ToolNameInvalid {
        invalid: invalid.clone(),
        valid: valid.clone(),
    };
    let mut output = json!({
        "success": false,
        "error": error.to_string(),
        "invalidFields": invalid,
        "validFields": valid,
    });
    if let Some(applied) = applied {
        output["appliedFields"] = json!(applied);
    }
    output
}

impl FrontendToolExecutor {
    pub fn new(bridge: BridgeHandle) -> Self {
        FrontendToolExecutor { bridge }
    }

    pub async fn execute(&self, tool_name: &str, input: Value) -> Result<Value> {
        let controller = self
            .bridge
            .current()
            .ok_or_else(|| EngineError::ToolFailed("no view is mounted".to_string()))?;

        match tool_name {
            RECORD_GET_FIELD_INFO => Ok(json!({
                "success": true,
                "fields": controller.field_info().await,
            })),
            RECORD_GET_VALUES => {
                let input: GetValuesInput = parse_input(tool_name, input)?;
                let values = controller.get_values().await;
                let Some(requested) = input.fields else {
                    return Ok(json!({"success": true, "values": values}));
                };
                let names = field_names(controller.as_ref()).await;
                let (known, unknown): (Vec<String>, Vec<String>) =
                    requested.into_iter().partition(|f| names.contains(f));
                if !unknown.is_empty() {
                    return Ok(invalid_fields(unknown, names, None));
                }
                let selected: Values = known
                    .into_iter()
                    .map(|f| {
                        let value = values.get(&f).cloned().unwrap_or(Value::Null);
                        (f, value)
                    })
                    .collect();
                Ok(json!({"success": true, "values": selected}))
            }
            RECORD_SET_VALUES => {
                let input: SetValuesInput = parse_input(tool_name, input)?;
                let names = field_names(controller.as_ref()).await;

                let mut valid = Values::new();
                let mut invalid = Vec::new();
                for (field, value) in input.values {
                    if names.contains(&field) {
                        valid.insert(field, value);
                    } else {
                        invalid.push(field);
                    }
                }
                let applied: Vec<String> = valid.keys().cloned().collect();
                if !valid.is_empty() {
                    controller.set_values(valid).await;
                }

                if invalid.is_empty() {
                    Ok(json!({"success": true, "appliedFields": applied}))
                } else {
                    tracing::debug!(?invalid, "Rejected unknown field names");
                    Ok(invalid_fields(invalid, names, Some(applied)))
                }
            }
            RECORD_RESET_FORM => {
                controller.reset().await;
                Ok(json!({"success": true}))
            }
            RECORD_VALIDATE_FORM => {
                let report = controller.validate().await;
                Ok(json!({
                    "success": report.valid,
                    "valid": report.valid,
                    "errors": report.errors,
                }))
            }
            other => Err(EngineError::InvalidArgument(format!(
                "'{}' is not a frontend tool",
                other
            ))),
        }
    }
}

async fn field_names(controller: &dyn ViewController) -> Vec<String> {
    controller
        .field_info()
        .await
        .into_iter()
        .map(|f| f.name)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{EntityModel, FieldDefinition};
    use tokio::sync::Mutex as AsyncMutex;

    /// Form backed by a model definition, as a view would render it
    pub(crate) struct TestForm {
        model: EntityModel,
        pub(crate) values: AsyncMutex<Values>,
    }

    impl TestForm {
        pub(crate) fn new(fields: Vec<FieldDefinition>) -> Self {
            TestForm {
                model: EntityModel::new("product", fields),
                values: AsyncMutex::new(Values::new()),
            }
        }
    }

    #[async_trait]
    impl ViewController for TestForm {
        async fn field_info(&self) -> Vec<FieldInfo> {
            self.model.fields.iter().map(FieldInfo::from).collect()
        }

        async fn get_values(&self) -> Values {
            self.values.lock().await.clone()
        }

        async fn set_values(&self, values: Values) {
            self.values.lock().await.extend(values);
        }

        async fn reset(&self) {
            self.values.lock().await.clear();
        }

        async fn validate(&self) -> ValidationReport {
            let values = self.values.lock().await.clone();
            self.model.validate(&values)
        }
    }

    fn name_only() -> Arc<TestForm> {
        Arc::new(TestForm::new(vec![
            FieldDefinition::new("name", FieldType::String).required(),
        ]))
    }

    #[tokio::test]
    async fn test_set_values_rejects_unknown_fields() {
        let bridge = BridgeHandle::new();
        let form = name_only();
        let _guard = bridge.mount(form.clone());
        let executor = FrontendToolExecutor::new(bridge);

        let output = executor
            .execute(RECORD_SET_VALUES, json!({"values": {"unknownField": "x"}}))
            .await
            .unwrap();

        assert_eq!(output["success"], false);
        let error = output["error"].as_str().unwrap();
        assert!(error.contains("unknownField"));
        assert!(error.contains("name"));
        assert_eq!(output["invalidFields"], json!(["unknownField"]));
        assert_eq!(output["validFields"], json!(["name"]));
        assert!(form.values.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_set_values_applies_valid_subset() {
        let bridge = BridgeHandle::new();
        let form = name_only();
        let _guard = bridge.mount(form.clone());
        let executor = FrontendToolExecutor::new(bridge);

        let output = executor
            .execute(RECORD_SET_VALUES, json!({"values": {"name": "Lamp", "colour": "red"}}))
            .await
            .unwrap();
        assert_eq!(output["success"], false);
        assert_eq!(output["appliedFields"], json!(["name"]));
        assert_eq!(form.values.lock().await["name"], "Lamp");

        let output = executor.execute(RECORD_GET_VALUES, json!({"fields": ["name"]})).await.unwrap();
        assert_eq!(output["values"], json!({"name": "Lamp"}));
    }

    #[tokio::test]
    async fn test_validate_reset_and_field_info() {
        let bridge = BridgeHandle::new();
        let form = name_only();
        let _guard = bridge.mount(form.clone());
        let executor = FrontendToolExecutor::new(bridge);

        let output = executor.execute(RECORD_VALIDATE_FORM, Value::Null).await.unwrap();
        assert_eq!(output["valid"], false);
        assert_eq!(output["errors"][0]["field"], "name");

        executor
            .execute(RECORD_SET_VALUES, json!({"values": {"name": "Lamp"}}))
            .await
            .unwrap();
        executor.execute(RECORD_RESET_FORM, json!({})).await.unwrap();
        assert!(form.values.lock().await.is_empty());

        let output = executor.execute(RECORD_GET_FIELD_INFO, json!({})).await.unwrap();
        assert_eq!(output["fields"][0]["type"], "string");
        assert_eq!(output["fields"][0]["required"], true);
    }

    #[tokio::test]
    async fn test_mount_guard_lifecycle() {
        let bridge = BridgeHandle::new();
        let executor = FrontendToolExecutor::new(bridge.clone());
        assert!(executor.execute(RECORD_RESET_FORM, json!({})).await.is_err());

        let first = bridge.mount(name_only());
        let second = bridge.mount(name_only());
        drop(first);
        assert!(bridge.is_mounted());
        drop(second);
        assert!(!bridge.is_mounted());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_argument() {
        let bridge = BridgeHandle::new();
        let _guard = bridge.mount(name_only());
        let err = FrontendToolExecutor::new(bridge)
            .execute("currentTime", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
