//! Template variable extraction, CRM resolution and substitution.

mod resolver;
mod value;

pub use resolver::{
    extract_variable_names, inject_computed_variables, resolve_crm_variables, resolve_template,
    substitute, validate_required, CrmContext, RequiredCheck, ResolvedTemplate, VariableError,
};
pub use value::{map_from_json, map_to_json, VariableMap, VariableValue};
