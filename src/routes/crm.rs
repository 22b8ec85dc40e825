use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::crm::{ContactSearch, PropertyDescriptor, SearchResults};
use crate::error::{AppError, AppResult};
use crate::models::CrmObjectType;
use crate::state::AppState;

const DEFAULT_SEARCH_LIMIT: u32 = 20;

#[derive(Deserialize)]
pub struct ContactSearchQuery {
    pub query: Option<String>,
    pub limit: Option<u32>,
    pub after: Option<String>,
}

impl From<ContactSearchQuery> for ContactSearch {
    fn from(params: ContactSearchQuery) -> Self {
        ContactSearch {
            query: params.query.filter(|query| !query.trim().is_empty()),
            limit: params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
            after: params.after.filter(|after| !after.is_empty()),
        }
    }
}

/// Properties a template can reference for the given object type.
pub async fn list_properties(
    State(state): State<AppState>,
    Path(object_type): Path<String>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<PropertyDescriptor>>> {
    let object_type: CrmObjectType = object_type.parse().map_err(AppError::bad_request)?;
    let properties = state.crm.get_properties(user.tenant_id, object_type).await?;
    Ok(Json(properties))
}

pub async fn search_contacts(
    State(state): State<AppState>,
    Query(params): Query<ContactSearchQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<SearchResults>> {
    let search = ContactSearch::from(params);
    let results = state.crm.search_contacts(user.tenant_id, &search).await?;
    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_search_parameters_are_dropped() {
        let search = ContactSearch::from(ContactSearchQuery {
            query: Some("   ".into()),
            limit: None,
            after: Some(String::new()),
        });
        assert_eq!(search.query, None);
        assert_eq!(search.limit, DEFAULT_SEARCH_LIMIT);
        assert_eq!(search.after, None);
    }
}
