use jsonschema::Validator;
use serde_json::Value;

/// A tool's declared parameter schema, compiled once when the tool is bound.
pub struct ArgumentSchema {
    validator: Validator,
}

impl ArgumentSchema {
    pub fn compile(schema: &Value) -> Result<Self, String> {
        Validator::new(schema)
            .map(|validator| Self { validator })
            .map_err(|e| format!("invalid JSON schema: {}", e))
    }

    /// Every violation, joined into one message for the model.
    pub fn check(&self, args: &Value) -> Result<(), String> {
        if self.validator.is_valid(args) {
            return Ok(());
        }
        let errors: Vec<String> = self
            .validator
            .iter_errors(args)
            .map(|e| e.to_string())
            .collect();
        Err(errors.join("; "))
    }
}
