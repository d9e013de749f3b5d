//! Binding of decoded secrets onto an action's declared parameters.

use std::collections::BTreeMap;

use crate::action::{ActionSignature, ParamKind};
use crate::context::{ActionContext, SecretValue};
use crate::error::{ActionsError, Result};

/// Parameters ready for the action body.
///
/// `values` is the caller's plain parameters exactly as received; secret and
/// context bindings sit beside them and never overwrite them.
#[derive(Debug, Clone, Default)]
pub struct BoundParameters {
    pub values: serde_json::Map<String, serde_json::Value>,
    pub secrets: BTreeMap<String, SecretValue>,
    pub context: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

/// Resolve every secret- and context-kind parameter of `signature` from `context`.
///
/// A required secret parameter with no same-named secret fails with
/// `MissingSecret`; secrets nobody asked for are ignored.
pub fn inject(
    signature: &ActionSignature,
    values: serde_json::Map<String, serde_json::Value>,
    context: &ActionContext,
) -> Result<BoundParameters> {
    let mut bound = BoundParameters {
        values,
        ..Default::default()
    };

    for param in &signature.parameters {
        match param.kind {
            ParamKind::Plain => {}
            ParamKind::Secret => match context.secret(&param.name) {
                Some(value) => {
                    bound.secrets.insert(param.name.clone(), value.clone());
                }
                None if param.required => {
                    return Err(ActionsError::MissingSecret(param.name.clone()));
                }
                None => {}
            },
            ParamKind::Context => {
                bound
                    .context
                    .insert(param.name.clone(), context.extra.clone());
            }
        }
    }

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Parameter;
    use serde_json::json;

    fn param(name: &str, kind: ParamKind, required: bool) -> Parameter {
        Parameter {
            name: name.into(),
            kind,
            required,
            description: None,
        }
    }

    fn signature(params: Vec<Parameter>) -> ActionSignature {
        ActionSignature {
            id: "test".into(),
            description: String::new(),
            parameters: params,
        }
    }

    fn context_with(secrets: &[(&str, &str)]) -> ActionContext {
        ActionContext {
            secrets: secrets
                .iter()
                .map(|(k, v)| (k.to_string(), SecretValue::new(*v)))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn binds_same_named_secret() {
        let sig = signature(vec![param("api_key", ParamKind::Secret, true)]);
        let bound = inject(&sig, Default::default(), &context_with(&[("api_key", "k")])).unwrap();
        assert_eq!(bound.secrets["api_key"].expose(), "k");
    }

    #[test]
    fn missing_required_secret_fails() {
        let sig = signature(vec![param("api_key", ParamKind::Secret, true)]);
        let err = inject(&sig, Default::default(), &context_with(&[("other", "x")])).unwrap_err();
        match err {
            ActionsError::MissingSecret(name) => assert_eq!(name, "api_key"),
            other => panic!("expected MissingSecret, got {other:?}"),
        }
    }

    #[test]
    fn missing_optional_secret_is_left_unbound() {
        let sig = signature(vec![param("api_key", ParamKind::Secret, false)]);
        let bound = inject(&sig, Default::default(), &ActionContext::default()).unwrap();
        assert!(bound.secrets.is_empty());
    }

    #[test]
    fn unused_secrets_are_ignored() {
        let sig = signature(vec![param("a", ParamKind::Secret, true)]);
        let bound = inject(
            &sig,
            Default::default(),
            &context_with(&[("a", "1"), ("b", "2")]),
        )
        .unwrap();
        assert_eq!(bound.secrets.len(), 1);
        assert!(!bound.secrets.contains_key("b"));
    }

    #[test]
    fn plain_values_pass_through_untouched() {
        let sig = signature(vec![
            param("city", ParamKind::Plain, true),
            param("city_token", ParamKind::Secret, true),
        ]);
        let values = json!({"city": "Lisbon", "unknown": 1})
            .as_object()
            .cloned()
            .unwrap();
        let bound = inject(&sig, values.clone(), &context_with(&[("city_token", "t")])).unwrap();
        assert_eq!(bound.values, values);
    }

    #[test]
    fn context_parameter_receives_extra_fields() {
        let sig = signature(vec![param("request", ParamKind::Context, true)]);
        let mut ctx = ActionContext::default();
        ctx.extra.insert("tenant".into(), json!("acme"));
        let bound = inject(&sig, Default::default(), &ctx).unwrap();
        assert_eq!(bound.context["request"]["tenant"], "acme");
    }
}
