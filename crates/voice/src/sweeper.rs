//! Timeout-Sweeper – schliesst inaktive Sessions
//!
//! Periodischer Durchlauf: unter dem Read-Lock werden alle Sessions
//! eingesammelt deren letzte Aktivitaet das konfigurierte Zeitlimit
//! ueberschreitet; NACH der Lock-Freigabe wird pro Session die Trennung
//! angefordert. Der eigentliche Teardown laeuft dann ueber den normalen
//! Verbindungs-geschlossen-Pfad des Verbindungs-Tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::session::SessionTable;

/// Takt des Sweepers
pub const SWEEP_INTERVALL: Duration = Duration::from_millis(15_500);

/// Periodischer Idle-Timeout-Scanner
pub struct TimeoutSweeper {
    tabelle: SessionTable,
    /// Zeitlimit in Millisekunden (live aenderbar, geteilt mit der Config)
    zeitlimit_ms: Arc<AtomicU64>,
}

impl TimeoutSweeper {
    /// Erstellt einen Sweeper
    pub fn neu(tabelle: SessionTable, zeitlimit_ms: Arc<AtomicU64>) -> Self {
        Self {
            tabelle,
            zeitlimit_ms,
        }
    }

    /// Laeuft bis der Shutdown-Kanal `true` meldet
    pub async fn lauf(self, mut shutdown: watch::Receiver<bool>) {
        let mut takt = tokio::time::interval(SWEEP_INTERVALL);
        takt.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Der erste Tick feuert sofort
        takt.tick().await;

        loop {
            tokio::select! {
                _ = takt.tick() => {
                    self.durchlauf();
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Timeout-Sweeper beendet");
    }

    /// Ein einzelner Scan; gibt die Anzahl der angestossenen Trennungen zurueck
    pub fn durchlauf(&self) -> usize {
        let zeitlimit = Duration::from_millis(self.zeitlimit_ms.load(Ordering::Relaxed));

        let mut zu_trennen = Vec::new();
        self.tabelle.fuer_alle(|session| {
            if session.inaktiv_seit() > zeitlimit {
                zu_trennen.push(Arc::clone(session));
            }
        });

        // Trennung erst nach Freigabe des Read-Locks anfordern
        for session in &zu_trennen {
            tracing::info!(
                session = %session.id,
                name = %session.name(),
                "Session wegen Inaktivitaet getrennt"
            );
            session.trennen();
        }
        zu_trennen.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn inaktive_sessions_werden_getrennt() {
        let tabelle = SessionTable::neu(10);
        let aktiv = tabelle.anlegen(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let inaktiv = tabelle.anlegen(Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        let sweeper = TimeoutSweeper::neu(tabelle, Arc::new(AtomicU64::new(20)));

        // Beide frisch: nichts passiert
        assert_eq!(sweeper.durchlauf(), 0);

        std::thread::sleep(Duration::from_millis(40));
        aktiv.aktivitaet_auffrischen();

        assert_eq!(sweeper.durchlauf(), 1);
        assert!(inaktiv.trennung.is_cancelled());
        assert!(!aktiv.trennung.is_cancelled());
    }

    #[test]
    fn grosses_zeitlimit_trennt_niemanden() {
        let tabelle = SessionTable::neu(10);
        let s = tabelle.anlegen(Ipv4Addr::new(10, 0, 0, 1)).unwrap();

        let sweeper = TimeoutSweeper::neu(tabelle, Arc::new(AtomicU64::new(3_600_000)));
        assert_eq!(sweeper.durchlauf(), 0);
        assert!(!s.trennung.is_cancelled());
    }
}
