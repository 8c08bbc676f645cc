//! Lead directory — where the driver reads lead capabilities and fields.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use dripline_core::error::{DriplineError, Result};

use crate::model::LeadSnapshot;
use crate::persistence::{DripDb, SequenceStore};

/// Read-only view of the CRM.
#[async_trait]
pub trait LeadDirectory: Send + Sync {
    /// Current capabilities and template fields of a lead.
    async fn snapshot(&self, lead_id: &str) -> Result<LeadSnapshot>;
}

/// Leads stored in the local `leads` table.
pub struct DbLeadDirectory {
    db: Arc<Mutex<DripDb>>,
}

impl DbLeadDirectory {
    pub fn new(db: Arc<Mutex<DripDb>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LeadDirectory for DbLeadDirectory {
    async fn snapshot(&self, lead_id: &str) -> Result<LeadSnapshot> {
        let db = self.db.lock().await;
        db.get_lead(lead_id)?
            .ok_or_else(|| DriplineError::not_found("lead", lead_id))
    }
}

/// Fixed set of leads held in memory.
#[derive(Default)]
pub struct StaticLeadDirectory {
    leads: HashMap<String, LeadSnapshot>,
}

impl StaticLeadDirectory {
    pub fn new(leads: impl IntoIterator<Item = LeadSnapshot>) -> Self {
        Self {
            leads: leads.into_iter().map(|l| (l.lead_id.clone(), l)).collect(),
        }
    }
}

#[async_trait]
impl LeadDirectory for StaticLeadDirectory {
    async fn snapshot(&self, lead_id: &str) -> Result<LeadSnapshot> {
        self.leads
            .get(lead_id)
            .cloned()
            .ok_or_else(|| DriplineError::Lead(format!("lead {lead_id} unavailable")))
    }
}
