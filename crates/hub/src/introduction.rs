//! Expert introductions to the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use askhub_protocol::MessageType;
use askhub_protocol::messages::IntroductionEvent;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionId};
use crate::error::HubError;
use crate::registry::ConnectionRegistry;

/// Where an expert connection is in the introduction handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroductionState {
    Connected,
    Introduced,
    /// The orchestrator restarted; the expert is expected to introduce again.
    Reintroducing,
}

/// What an expert advertised about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpertIntroduction {
    pub identity: String,
    pub name: String,
    pub description: String,
}

struct Record {
    identity: String,
    state: IntroductionState,
    name: String,
    description: String,
}

pub struct IntroductionProtocol {
    registry: Arc<ConnectionRegistry>,
    orchestrator_identity: String,
    wait_timeout: Duration,
    records: RwLock<HashMap<ConnectionId, Record>>,
}

impl IntroductionProtocol {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        orchestrator_identity: impl Into<String>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            orchestrator_identity: orchestrator_identity.into(),
            wait_timeout,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Starts tracking a freshly connected expert.
    pub async fn track(&self, conn: &Connection) {
        self.records.write().await.insert(
            conn.id(),
            Record {
                identity: conn.identity().to_string(),
                state: IntroductionState::Connected,
                name: String::new(),
                description: String::new(),
            },
        );
    }

    /// Forwards an introduction from `conn` to the orchestrator.
    ///
    /// Waits up to the configured window for the orchestrator to connect.
    pub async fn introduce(
        &self,
        conn: &Connection,
        name: &str,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HubError> {
        let orchestrator = self
            .registry
            .wait_for(&self.orchestrator_identity, self.wait_timeout, cancel)
            .await?;

        let event = IntroductionEvent {
            identity: conn.identity().to_string(),
            name: name.to_string(),
            description: description.to_string(),
        };
        orchestrator.push(MessageType::Introduce, Some(&event))?;

        let mut records = self.records.write().await;
        let record = records.entry(conn.id()).or_insert_with(|| Record {
            identity: conn.identity().to_string(),
            state: IntroductionState::Connected,
            name: String::new(),
            description: String::new(),
        });
        record.state = IntroductionState::Introduced;
        record.name = event.name;
        record.description = event.description;

        info!(identity = %conn.identity(), name, "expert introduced");
        Ok(())
    }

    /// Moves every introduced expert to [`IntroductionState::Reintroducing`].
    ///
    /// Returns how many experts changed state.
    pub async fn mark_reintroducing(&self) -> usize {
        let mut records = self.records.write().await;
        let mut count = 0;
        for record in records.values_mut() {
            if record.state == IntroductionState::Introduced {
                record.state = IntroductionState::Reintroducing;
                count += 1;
            }
        }
        debug!(count, "experts awaiting reintroduction");
        count
    }

    pub async fn state(&self, conn_id: ConnectionId) -> Option<IntroductionState> {
        self.records.read().await.get(&conn_id).map(|r| r.state)
    }

    /// Experts currently introduced to the orchestrator.
    pub async fn introduced_experts(&self) -> Vec<ExpertIntroduction> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.state == IntroductionState::Introduced)
            .map(|r| ExpertIntroduction {
                identity: r.identity.clone(),
                name: r.name.clone(),
                description: r.description.clone(),
            })
            .collect()
    }

    pub async fn forget(&self, conn_id: ConnectionId) -> bool {
        self.records.write().await.remove(&conn_id).is_some()
    }
}
