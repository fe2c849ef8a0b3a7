use rusqlite::{params, OptionalExtension};

use peerlink_shared::types::{Profile, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::ProfileInput;

impl Database {
    pub fn get_profile(&self) -> Result<Option<Profile>> {
        let profile = self
            .conn()
            .query_row(
                "SELECT user_id, name, email, ip, created_at FROM profile WHERE id = 1",
                [],
                |row| {
                    Ok(Profile {
                        user_id: UserId(row.get(0)?),
                        name: row.get(1)?,
                        email: row.get(2)?,
                        ip: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    /// Register or update the local profile.
    ///
    /// All fields are trimmed and must be non-empty. The user id and
    /// creation time of an existing profile are kept.
    pub fn save_profile(&self, input: &ProfileInput) -> Result<Profile> {
        let name = required(&input.name, "Name")?;
        let email = required(&input.email, "Email")?;
        let ip = required(&input.ip, "IP")?;

        let existing = self.get_profile()?;
        let profile = Profile {
            user_id: existing
                .as_ref()
                .map(|p| p.user_id.clone())
                .unwrap_or_default(),
            created_at: existing
                .as_ref()
                .map_or_else(peerlink_shared::now_millis, |p| p.created_at),
            name,
            email,
            ip,
        };

        self.conn().execute(
            "INSERT OR REPLACE INTO profile (id, user_id, name, email, ip, created_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                profile.user_id.as_str(),
                profile.name,
                profile.email,
                profile.ip,
                profile.created_at,
            ],
        )?;

        tracing::info!(user = %profile.user_id, name = %profile.name, "profile saved");
        Ok(profile)
    }

    pub fn clear_profile(&self) -> Result<bool> {
        let affected = self.conn().execute("DELETE FROM profile WHERE id = 1", [])?;
        Ok(affected > 0)
    }
}

fn required(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation(format!("{field} required")));
    }
    Ok(trimmed.to_string())
}
