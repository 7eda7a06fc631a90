//! Contact lookup by phone number.
//!
//! `contact_phone_index` is maintained by the CRM side; this module only reads
//! it. Numbers are stored in E.164 form.

use super::{ContactMatch, Database};
use crate::orchestrator::ContactLookup;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;

impl Database {
    pub async fn find_contact_by_phone(&self, e164: &str) -> Result<Option<ContactMatch>> {
        let row = sqlx::query(
            "SELECT contact_id, deal_id, lead_id, display_name
             FROM contact_phone_index WHERE phone_e164 = $1
             ORDER BY contact_id LIMIT 1",
        )
        .bind(e164)
        .fetch_optional(&self.pool)
        .await?;
        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(ContactMatch {
            contact_id: r.try_get("contact_id")?,
            deal_id: r.try_get("deal_id")?,
            lead_id: r.try_get("lead_id")?,
            display_name: r.try_get("display_name")?,
        }))
    }
}

#[async_trait]
impl ContactLookup for Database {
    async fn find_by_phone(&self, e164: &str) -> Result<Option<ContactMatch>> {
        self.find_contact_by_phone(e164).await
    }
}
