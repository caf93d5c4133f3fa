//! Placeholder substitution in function actions.
//!
//! `$name` and `${name}` are replaced by the value of a scenario parameter,
//! `$$` by a literal dollar. A string made of a single placeholder takes the
//! raw JSON value of the parameter, so numbers and lists keep their type.

use std::collections::HashMap;

use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

use openbach_shared::errors::OpenbachError;
use openbach_shared::scenario::ScenarioDefinition;

const PLACEHOLDER: &str = r"\$(?:\$|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))";

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("Unknown placeholder ${0}")]
    Unknown(String),

    #[error("Scenario {scenario} is missing argument(s): {names}")]
    MissingArguments { scenario: String, names: String },

    #[error("Scenario {scenario} takes no argument named {name}")]
    UnexpectedArgument { scenario: String, name: String },

    #[error("Invalid placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<ParameterError> for OpenbachError {
    fn from(error: ParameterError) -> Self {
        match error {
            ParameterError::Pattern(_) => OpenbachError::internal(error.to_string()),
            _ => OpenbachError::bad_request(error.to_string()),
        }
    }
}

/// Constants of `definition` overlaid with the instance `arguments`.
///
/// Every declared argument must be given, and no undeclared one may be.
pub fn build_parameters(
    definition: &ScenarioDefinition,
    arguments: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, ParameterError> {
    if let Some(name) = arguments
        .keys()
        .find(|name| !definition.arguments.contains_key(*name))
    {
        return Err(ParameterError::UnexpectedArgument {
            scenario: definition.name.clone(),
            name: name.clone(),
        });
    }

    let mut missing: Vec<&str> = definition
        .arguments
        .keys()
        .filter(|name| !arguments.contains_key(*name))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(ParameterError::MissingArguments {
            scenario: definition.name.clone(),
            names: missing.join(", "),
        });
    }

    let mut parameters = definition.constants.clone();
    parameters.extend(arguments.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(parameters)
}

/// Substitutes placeholders against a fixed set of parameters.
pub struct Resolver<'a> {
    pattern: Regex,
    parameters: &'a HashMap<String, Value>,
}

impl<'a> Resolver<'a> {
    pub fn new(parameters: &'a HashMap<String, Value>) -> Result<Self, ParameterError> {
        Ok(Self {
            pattern: Regex::new(PLACEHOLDER)?,
            parameters,
        })
    }

    /// Resolve every string found in `value`, recursing into arrays and objects.
    pub fn resolve(&self, value: &Value) -> Result<Value, ParameterError> {
        match value {
            Value::String(text) => self.resolve_str(text),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.resolve(item)?)))
                .collect::<Result<serde_json::Map<_, _>, ParameterError>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, text: &str) -> Result<Value, ParameterError> {
        if let Some(captures) = self.pattern.captures(text) {
            let whole = captures.get(0).map(|m| m.as_str().len()) == Some(text.len());
            if whole {
                if let Some(name) = placeholder_name(&captures) {
                    return self.lookup(name).cloned();
                }
            }
        }

        let mut unknown = None;
        let replaced = self.pattern.replace_all(text, |captures: &Captures| {
            match placeholder_name(captures) {
                None => "$".to_string(),
                Some(name) => match self.lookup(name) {
                    Ok(Value::String(value)) => value.clone(),
                    Ok(value) => value.to_string(),
                    Err(e) => {
                        unknown.get_or_insert(e);
                        String::new()
                    }
                },
            }
        });
        match unknown {
            Some(e) => Err(e),
            None => Ok(Value::String(replaced.into_owned())),
        }
    }

    fn lookup(&self, name: &str) -> Result<&Value, ParameterError> {
        self.parameters
            .get(name)
            .ok_or_else(|| ParameterError::Unknown(name.to_string()))
    }
}

fn placeholder_name<'t>(captures: &Captures<'t>) -> Option<&'t str> {
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openbach_shared::scenario_json::parse_scenario;
    use serde_json::json;

    fn parameters() -> HashMap<String, Value> {
        HashMap::from([
            ("server".to_string(), json!("10.0.0.3")),
            ("duration".to_string(), json!(30)),
            ("ports".to_string(), json!([5201, 5202])),
        ])
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let params = parameters();
        let resolver = Resolver::new(&params).unwrap();
        assert_eq!(resolver.resolve(&json!("$duration")).unwrap(), json!(30));
        assert_eq!(
            resolver.resolve(&json!("${ports}")).unwrap(),
            json!([5201, 5202])
        );
    }

    #[test]
    fn test_interpolation_and_escape() {
        let params = parameters();
        let resolver = Resolver::new(&params).unwrap();
        assert_eq!(
            resolver
                .resolve(&json!({
                    "arguments": ["-c", "$server", "-t ${duration}s", "cost: $$5"],
                    "offset": 2.5,
                }))
                .unwrap(),
            json!({
                "arguments": ["-c", "10.0.0.3", "-t 30s", "cost: $5"],
                "offset": 2.5,
            })
        );
        assert_eq!(resolver.resolve(&json!("$$")).unwrap(), json!("$"));
    }

    #[test]
    fn test_unknown_placeholder() {
        let params = parameters();
        let resolver = Resolver::new(&params).unwrap();
        let error = resolver.resolve(&json!(["ok", "-p ${port}"])).unwrap_err();
        assert!(matches!(error, ParameterError::Unknown(ref name) if name == "port"));
        assert!(matches!(
            OpenbachError::from(error),
            OpenbachError::BadRequest { .. }
        ));
    }

    #[test]
    fn test_build_parameters() {
        let definition = parse_scenario(
            r#"{
                name: "rate",
                constants: { duration: 10, server: "10.0.0.3" },
                arguments: { duration: "Test length in seconds" },
                openbach_functions: [],
            }"#,
        )
        .unwrap();

        let parameters =
            build_parameters(&definition, &HashMap::from([("duration".into(), json!(60))]))
                .unwrap();
        assert_eq!(parameters["duration"], json!(60));
        assert_eq!(parameters["server"], json!("10.0.0.3"));

        assert!(matches!(
            build_parameters(&definition, &HashMap::new()),
            Err(ParameterError::MissingArguments { .. })
        ));
        assert!(matches!(
            build_parameters(
                &definition,
                &HashMap::from([
                    ("duration".into(), json!(60)),
                    ("client".into(), json!("a")),
                ])
            ),
            Err(ParameterError::UnexpectedArgument { .. })
        ));
    }
}
