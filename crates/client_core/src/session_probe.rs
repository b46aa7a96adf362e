use std::sync::Arc;

use shared::{domain::SessionReadiness, protocol::SessionSnapshot};
use tracing::{info, warn};

use crate::backend::WizardBackend;

/// Classifies a `/debug_session` snapshot. A run needs a client identity, a stored
/// dataset, and a stored model.
pub fn classify(snapshot: &SessionSnapshot) -> SessionReadiness {
    let client_id = snapshot
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let mut missing = Vec::new();
    if client_id.is_none() {
        missing.push("no client identity");
    }
    if !snapshot.has_data_set {
        missing.push("no stored dataset");
    }
    if !snapshot.has_model {
        missing.push("no selected model");
    }

    match client_id {
        Some(client_id) if missing.is_empty() => SessionReadiness::Ready {
            client_id: client_id.to_string(),
        },
        _ => SessionReadiness::NotReady {
            reason: format!(
                "session data is incomplete ({}); start over from the first step",
                missing.join(", ")
            ),
        },
    }
}

#[derive(Clone)]
pub struct SessionProbe {
    backend: Arc<dyn WizardBackend>,
}

impl SessionProbe {
    pub fn new(backend: Arc<dyn WizardBackend>) -> Self {
        Self { backend }
    }

    /// Always re-queries; a failure to reach the service is reported as `Unreachable`.
    pub async fn probe(&self) -> SessionReadiness {
        match self.backend.debug_session().await {
            Ok(snapshot) => {
                let readiness = classify(&snapshot);
                info!(
                    ready = readiness.is_ready(),
                    session_keys = ?snapshot.session_keys,
                    "session: probe completed"
                );
                readiness
            }
            Err(err) => {
                warn!(error = %err, "session: probe could not reach the service");
                SessionReadiness::Unreachable {
                    reason: format!("could not check the session: {err}"),
                }
            }
        }
    }
}
