use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ProvisioningError;
use crate::identity::Identity;
use crate::registry::SessionRegistry;
use crate::session::AgentSession;
use crate::tools::{ProvisionRequest, WalletProvisioner};
use crate::wallet_store::{WalletRecord, WalletStore};

/// Credentials and limits applied to every new session.
#[derive(Debug, Clone)]
pub struct FactorySettings {
    pub credential_name: String,
    pub credential_key: String,
    pub network_id: String,
    pub max_history_turns: usize,
}

/// What happened while creating a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreationReport {
    /// Prior wallet state was found and handed to the provisioner.
    pub restored: bool,
    /// The provisioned wallet state reached the store.
    pub persisted: bool,
    /// Load/save/export failures that were logged and tolerated.
    pub persistence_warnings: u32,
}

/// Builds a session for an identity: wallet tools from the provisioner,
/// fresh memory, and the shared system instruction.
pub struct SessionFactory {
    store: Arc<dyn WalletStore>,
    provisioner: Arc<dyn WalletProvisioner>,
    settings: FactorySettings,
    instructions: Arc<str>,
}

impl SessionFactory {
    pub fn new(
        store: Arc<dyn WalletStore>,
        provisioner: Arc<dyn WalletProvisioner>,
        settings: FactorySettings,
        instructions: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            store,
            provisioner,
            settings,
            instructions: instructions.into(),
        }
    }

    /// Create and register the session for `identity`.
    ///
    /// Provisioning always runs and its exported state always overwrites the
    /// stored record, even when a record already existed, so provider-side
    /// wallet changes are captured. Store failures are logged and tolerated;
    /// provisioning failures propagate and nothing is registered.
    pub async fn create(
        &self,
        identity: &Identity,
        registry: &mut SessionRegistry,
    ) -> Result<CreationReport, ProvisioningError> {
        let mut report = CreationReport::default();

        let prior = match self.store.load(identity).await {
            Ok(record) => record,
            Err(e) => {
                warn!(identity = %identity, error = %e, "failed to load wallet record, provisioning fresh wallet");
                report.persistence_warnings += 1;
                None
            }
        };
        report.restored = prior.is_some();

        let tools = self
            .provisioner
            .provision(ProvisionRequest {
                identity: identity.clone(),
                credential_name: self.settings.credential_name.clone(),
                credential_key: self.settings.credential_key.clone(),
                prior_state: prior.map(|record| record.payload),
                network_id: self.settings.network_id.clone(),
            })
            .await?;

        let session = AgentSession::new(
            identity.clone(),
            Arc::clone(&tools),
            Arc::clone(&self.instructions),
            self.settings.max_history_turns,
        );

        match tools.export_state().await {
            Ok(payload) => {
                let record = WalletRecord::new(identity.clone(), payload);
                match self.store.save(&record).await {
                    Ok(()) => report.persisted = true,
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "failed to save wallet record, continuing with in-memory wallet");
                        report.persistence_warnings += 1;
                    }
                }
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "failed to export wallet state");
                report.persistence_warnings += 1;
            }
        }

        registry.put(session);

        info!(
            identity = %identity,
            wallet = %tools.address(),
            network_id = %tools.network_id(),
            restored = report.restored,
            persisted = report.persisted,
            "session created"
        );
        Ok(report)
    }
}
