//! Presence broadcasts and orchestrator restart recovery.

use std::sync::Arc;

use askhub_protocol::MessageType;
use askhub_protocol::messages::ExpertPresenceEvent;
use tracing::{info, warn};

use crate::connection::{Connection, Role};
use crate::introduction::IntroductionProtocol;
use crate::registry::ConnectionRegistry;

/// Reacts to participants joining and leaving the registry.
pub struct ReconnectCoordinator {
    registry: Arc<ConnectionRegistry>,
    introductions: Arc<IntroductionProtocol>,
}

impl ReconnectCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, introductions: Arc<IntroductionProtocol>) -> Self {
        Self {
            registry,
            introductions,
        }
    }

    /// Read from the registry, so a stale orchestrator handle leaving after
    /// its replacement arrived cannot flip it off.
    pub async fn orchestrator_online(&self) -> bool {
        !self.registry.with_role(Role::Orchestrator).await.is_empty()
    }

    /// Called after `conn` has been registered.
    pub async fn on_registered(&self, conn: &Connection) {
        match conn.role() {
            Role::Orchestrator => {
                info!(identity = %conn.identity(), "orchestrator online, routing resumed");
            }
            Role::Expert => {
                let event = ExpertPresenceEvent {
                    identity: conn.identity().to_string(),
                };
                let targets = self.observers().await;
                broadcast(&targets, MessageType::ExpertJoined, Some(&event));
            }
            Role::EndUser => {}
        }
    }

    /// Called after `conn` has been removed from the registry.
    ///
    /// Not called for stale handles that had already been superseded.
    pub async fn on_unregistered(&self, conn: &Connection) {
        match conn.role() {
            Role::Orchestrator => {
                info!(identity = %conn.identity(), "orchestrator left");
                self.request_reintroductions().await;
            }
            Role::Expert => {
                let event = ExpertPresenceEvent {
                    identity: conn.identity().to_string(),
                };
                let targets = self.observers().await;
                broadcast(&targets, MessageType::ExpertLeft, Some(&event));
            }
            Role::EndUser => {}
        }
    }

    /// Called when a new connection took over `previous`'s identity before
    /// `previous` disconnected.
    ///
    /// A replaced orchestrator has lost the experts' introductions just as
    /// if it had left, so they are asked to introduce again.
    pub async fn on_replaced(&self, previous: &Connection) {
        if previous.role() == Role::Orchestrator {
            info!(identity = %previous.identity(), conn = %previous.id(), "orchestrator replaced");
            self.request_reintroductions().await;
        }
    }

    async fn request_reintroductions(&self) -> usize {
        self.introductions.mark_reintroducing().await;
        let experts = self.registry.with_role(Role::Expert).await;
        info!(experts = experts.len(), "requesting reintroductions");
        broadcast::<()>(&experts, MessageType::Reintroduce, None)
    }

    /// Orchestrator and end-user connections: who hears about experts.
    async fn observers(&self) -> Vec<Connection> {
        let mut targets = self.registry.with_role(Role::Orchestrator).await;
        targets.extend(self.registry.with_role(Role::EndUser).await);
        targets
    }
}

/// Best-effort push to every connection in `targets`; returns how many
/// sends succeeded.
fn broadcast<T: serde::Serialize>(
    targets: &[Connection],
    msg_type: MessageType,
    payload: Option<&T>,
) -> usize {
    let mut delivered = 0;
    for conn in targets {
        match conn.push(msg_type.clone(), payload) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(identity = %conn.identity(), ?msg_type, "broadcast failed: {e}"),
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use askhub_protocol::envelope::Message;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    use super::*;
    use crate::connection::Sender;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        coordinator: ReconnectCoordinator,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let introductions = Arc::new(IntroductionProtocol::new(
            registry.clone(),
            "Orchestrator",
            Duration::from_secs(30),
        ));
        Fixture {
            coordinator: ReconnectCoordinator::new(registry.clone(), introductions),
            registry,
        }
    }

    impl Fixture {
        async fn join(&self, identity: &str, role: Role) -> (Connection, mpsc::Receiver<WsMessage>) {
            let (tx, rx) = mpsc::channel(16);
            let conn = Connection::new(identity, role, Sender::new(tx));
            self.registry.register(conn.clone()).await;
            self.coordinator.on_registered(&conn).await;
            (conn, rx)
        }

        async fn leave(&self, conn: &Connection) {
            assert!(self.registry.unregister(conn).await);
            self.coordinator.on_unregistered(conn).await;
        }
    }

    fn drain(rx: &mut mpsc::Receiver<WsMessage>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(WsMessage::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn count(msgs: &[Message], msg_type: MessageType) -> usize {
        msgs.iter().filter(|m| m.msg_type == msg_type).count()
    }

    #[tokio::test]
    async fn orchestrator_drop_reintroduces_each_expert_once() {
        let f = fixture();
        let (orch, _orch_rx) = f.join("Orchestrator", Role::Orchestrator).await;
        let (_u, mut user_rx) = f.join("EndUser", Role::EndUser).await;
        let mut experts = Vec::new();
        for name in ["Teams", "Matches", "Districts"] {
            experts.push(f.join(name, Role::Expert).await);
        }
        assert!(f.coordinator.orchestrator_online().await);
        drain(&mut user_rx);

        f.leave(&orch).await;
        assert!(!f.coordinator.orchestrator_online().await);

        for (_, rx) in &mut experts {
            let msgs = drain(rx);
            assert_eq!(count(&msgs, MessageType::Reintroduce), 1);
        }
        assert_eq!(count(&drain(&mut user_rx), MessageType::Reintroduce), 0);
    }

    #[tokio::test]
    async fn expert_presence_reaches_orchestrator_and_end_user() {
        let f = fixture();
        let (_o, mut orch_rx) = f.join("Orchestrator", Role::Orchestrator).await;
        let (_u, mut user_rx) = f.join("EndUser", Role::EndUser).await;
        let (_other, mut other_rx) = f.join("Matches", Role::Expert).await;

        let (teams, _t) = f.join("Teams", Role::Expert).await;
        f.leave(&teams).await;

        for rx in [&mut orch_rx, &mut user_rx] {
            let msgs = drain(rx);
            let joined: Vec<ExpertPresenceEvent> = msgs
                .iter()
                .filter(|m| m.msg_type == MessageType::ExpertJoined)
                .map(|m| m.parse_payload().unwrap().unwrap())
                .collect();
            assert!(joined.iter().any(|e| e.identity == "Teams"));
            assert_eq!(count(&msgs, MessageType::ExpertLeft), 1);
        }
        // Experts do not hear about each other.
        let msgs = drain(&mut other_rx);
        assert_eq!(count(&msgs, MessageType::ExpertJoined), 0);
        assert_eq!(count(&msgs, MessageType::ExpertLeft), 0);
    }

    #[tokio::test]
    async fn broadcast_skips_closed_connections() {
        let f = fixture();
        let (_o, orch_rx) = f.join("Orchestrator", Role::Orchestrator).await;
        drop(orch_rx);
        let (_u, mut user_rx) = f.join("EndUser", Role::EndUser).await;

        let (teams, _t) = f.join("Teams", Role::Expert).await;
        f.leave(&teams).await;
        assert_eq!(count(&drain(&mut user_rx), MessageType::ExpertLeft), 1);
    }

    #[tokio::test]
    async fn stale_orchestrator_leaving_keeps_routing_online() {
        let f = fixture();
        let (old, _old_rx) = f.join("Orchestrator", Role::Orchestrator).await;
        let (_new, _new_rx) = f.join("Orchestrator", Role::Orchestrator).await;

        // The stale handle is no longer registered; its teardown must not
        // take the replacement offline.
        assert!(!f.registry.unregister(&old).await);
        assert!(f.coordinator.orchestrator_online().await);
        f.coordinator.on_unregistered(&old).await;
        assert!(f.coordinator.orchestrator_online().await);
    }

    #[tokio::test]
    async fn replaced_orchestrator_requests_reintroductions() {
        let f = fixture();
        let (old, _old_rx) = f.join("Orchestrator", Role::Orchestrator).await;
        let (_teams, mut teams_rx) = f.join("Teams", Role::Expert).await;
        let (_user, mut user_rx) = f.join("EndUser", Role::EndUser).await;

        f.coordinator.on_replaced(&old).await;
        assert_eq!(count(&drain(&mut teams_rx), MessageType::Reintroduce), 1);
        assert_eq!(count(&drain(&mut user_rx), MessageType::Reintroduce), 0);
    }

    #[tokio::test]
    async fn replaced_expert_requests_nothing() {
        let f = fixture();
        let (_o, _orch_rx) = f.join("Orchestrator", Role::Orchestrator).await;
        let (old, mut old_rx) = f.join("Teams", Role::Expert).await;

        f.coordinator.on_replaced(&old).await;
        assert_eq!(count(&drain(&mut old_rx), MessageType::Reintroduce), 0);
    }
}
