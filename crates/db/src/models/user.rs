use fishsense_core::label_studio::LabelStudioUser;
use fishsense_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `users` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: DbId,
    pub label_studio_id: Option<i64>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub last_activity: Option<Timestamp>,
    pub date_joined: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Upsert keyed on `email`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertUser {
    pub label_studio_id: Option<i64>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub last_activity: Option<Timestamp>,
    pub date_joined: Option<Timestamp>,
}

impl From<&LabelStudioUser> for UpsertUser {
    fn from(user: &LabelStudioUser) -> Self {
        Self {
            label_studio_id: Some(user.id),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            last_activity: user.last_activity,
            date_joined: user.date_joined,
        }
    }
}
