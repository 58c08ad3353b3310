//! Control-Broadcaster – Send-Queues aller verbundenen Clients
//!
//! Jede Verbindung registriert beim Aufbau eine Send-Queue; der
//! Verbindungs-Task liest daraus und schreibt auf den Stream. Gesendet
//! wird nicht-blockierend: eine volle Queue verwirft die Nachricht
//! (der Stream ist dann ohnehin im Rueckstau).

use dashmap::DashMap;
use sprechfunk_core::SessionId;
use sprechfunk_protocol::control::ControlMessage;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Groesse der Send-Queue pro Client
const SEND_QUEUE_GROESSE: usize = 64;

/// Handle auf die Send-Queue eines Clients
#[derive(Clone, Debug)]
struct ClientSender {
    tx: mpsc::Sender<ControlMessage>,
}

/// Zentraler Broadcaster fuer Control-Nachrichten
///
/// Thread-safe via Arc + DashMap; `Clone` teilt den Zustand.
#[derive(Clone, Default)]
pub struct ControlBroadcaster {
    clients: Arc<DashMap<SessionId, ClientSender>>,
}

impl ControlBroadcaster {
    /// Erstellt einen leeren Broadcaster
    pub fn neu() -> Self {
        Self::default()
    }

    /// Registriert eine Session und gibt ihre Empfangs-Queue zurueck
    ///
    /// Der Verbindungs-Task liest aus dieser Queue und sendet via Stream.
    pub fn registrieren(&self, session: SessionId) -> mpsc::Receiver<ControlMessage> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_GROESSE);
        self.clients.insert(session, ClientSender { tx });
        rx
    }

    /// Entfernt eine Session aus dem Broadcaster
    pub fn entfernen(&self, session: &SessionId) {
        self.clients.remove(session);
    }

    /// Sendet eine Nachricht an eine einzelne Session
    ///
    /// Gibt `false` zurueck wenn die Session unbekannt ist oder ihre
    /// Queue voll/geschlossen ist.
    pub fn an_session(&self, session: &SessionId, nachricht: ControlMessage) -> bool {
        let Some(sender) = self.clients.get(session) else {
            tracing::trace!(session = %session, "Senden an unbekannte Session");
            return false;
        };
        match sender.tx.try_send(nachricht) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session = %session, "Send-Queue voll, Nachricht verworfen");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(session = %session, "Send-Queue geschlossen");
                false
            }
        }
    }

    /// Sendet an alle registrierten Sessions ausser einer
    ///
    /// Gibt die Anzahl erfolgreicher Einreihungen zurueck.
    pub fn an_alle_ausser(&self, ausser: &SessionId, nachricht: ControlMessage) -> usize {
        let mut gesendet = 0;
        for eintrag in self.clients.iter() {
            if eintrag.key() == ausser {
                continue;
            }
            if eintrag.value().tx.try_send(nachricht.clone()).is_ok() {
                gesendet += 1;
            }
        }
        gesendet
    }

    /// Prueft ob eine Session registriert ist
    pub fn ist_registriert(&self, session: &SessionId) -> bool {
        self.clients.contains_key(session)
    }

    /// Anzahl registrierter Sessions
    pub fn anzahl(&self) -> usize {
        self.clients.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
