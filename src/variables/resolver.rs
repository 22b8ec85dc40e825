use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::value::{VariableMap, VariableValue};
use crate::crm::CrmApi;
use crate::models::{CrmObjectRef, VariableDeclaration};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^}]*)\}\}").expect("placeholder pattern is valid"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariableError {
    #[error("missing required variables: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredCheck {
    pub ok: bool,
    pub missing: Vec<String>,
}

impl RequiredCheck {
    pub fn into_result(self) -> Result<(), VariableError> {
        if self.ok {
            Ok(())
        } else {
            Err(VariableError::MissingRequired(self.missing))
        }
    }
}

/// CRM record a document is generated for.
#[derive(Debug, Clone)]
pub struct CrmContext {
    pub tenant_id: Uuid,
    pub object: CrmObjectRef,
}

#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub html: String,
    pub variables: VariableMap,
}

/// Names of every `{{token}}` in `html`, trimmed. Empty tokens are ignored.
pub fn extract_variable_names(html: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(html)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

pub fn validate_required(
    declarations: &[VariableDeclaration],
    supplied: &VariableMap,
) -> RequiredCheck {
    let missing: Vec<String> = declarations
        .iter()
        .filter(|declaration| declaration.required && !supplied.contains_key(&declaration.name))
        .map(|declaration| declaration.name.clone())
        .collect();

    RequiredCheck {
        ok: missing.is_empty(),
        missing,
    }
}

/// Fills CRM-backed declarations on top of the supplied values.
///
/// A declaration is looked up live only when its namespace matches the
/// context's object type; the live value replaces any supplied one. Every
/// other CRM declaration keeps its supplied value or falls back to its default
/// (or empty). Lookup failures are isolated to the variable that failed.
pub async fn resolve_crm_variables(
    declarations: &[VariableDeclaration],
    supplied: &VariableMap,
    context: Option<&CrmContext>,
    crm: &dyn CrmApi,
) -> VariableMap {
    let mut resolved = supplied.clone();

    for declaration in declarations {
        let Some(namespace) = declaration.kind.crm_object_type() else {
            continue;
        };

        let matching = context.filter(|ctx| ctx.object.object_type == namespace);
        let Some(ctx) = matching else {
            resolved
                .entry(declaration.name.clone())
                .or_insert_with(|| fallback(declaration));
            continue;
        };

        let property = declaration.property_name().to_string();
        let value = match crm
            .get_object(
                ctx.tenant_id,
                ctx.object.object_type,
                &ctx.object.object_id,
                std::slice::from_ref(&property),
            )
            .await
        {
            Ok(object) => match object.properties.get(&property) {
                Some(value) if !value.is_blank() => value.clone(),
                _ => {
                    debug!(variable = %declaration.name, "CRM property empty; using default");
                    fallback(declaration)
                }
            },
            Err(err) => {
                warn!(
                    variable = %declaration.name,
                    object_id = %ctx.object.object_id,
                    error = %err,
                    "CRM lookup failed; using default"
                );
                fallback(declaration)
            }
        };
        resolved.insert(declaration.name.clone(), value);
    }

    resolved
}

/// Adds date variables without overwriting caller-supplied values.
pub fn inject_computed_variables(mut map: VariableMap, now: DateTime<Utc>) -> VariableMap {
    let computed = [
        ("current_date", now.format("%B %-d, %Y").to_string()),
        (
            "current_datetime",
            now.format("%B %-d, %Y %H:%M UTC").to_string(),
        ),
        ("current_year", now.format("%Y").to_string()),
        ("current_month", now.format("%B").to_string()),
    ];

    for (name, value) in computed {
        map.entry(name.to_string())
            .or_insert(VariableValue::Text(value));
    }
    map
}

/// Replaces every `{{ name }}` with its formatted value; unknown names become empty.
pub fn substitute(html: &str, values: &VariableMap) -> String {
    PLACEHOLDER
        .replace_all(html, |caps: &Captures<'_>| {
            caps.get(1)
                .and_then(|name| values.get(name.as_str().trim()))
                .map(VariableValue::display)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Runs validation, CRM resolution, computed injection and substitution in order.
pub async fn resolve_template(
    content: &str,
    declarations: &[VariableDeclaration],
    supplied: &VariableMap,
    context: Option<&CrmContext>,
    crm: &dyn CrmApi,
    now: DateTime<Utc>,
) -> Result<ResolvedTemplate, VariableError> {
    validate_required(declarations, supplied).into_result()?;
    let resolved = resolve_crm_variables(declarations, supplied, context, crm).await;
    let variables = inject_computed_variables(resolved, now);
    let html = substitute(content, &variables);
    Ok(ResolvedTemplate { html, variables })
}

fn fallback(declaration: &VariableDeclaration) -> VariableValue {
    VariableValue::Text(declaration.default_value.clone().unwrap_or_default())
}
