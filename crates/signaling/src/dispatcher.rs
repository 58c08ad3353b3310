//! Control-Dispatcher – Verarbeitung eingehender Control-Nachrichten
//!
//! Behandelt das minimale Control-Vokabular des Kerns: Authentifizierung,
//! Ping, Kanalwechsel, Selbst-Mute/Deaf, Crypt-Resync und den
//! TCP-Voice-Fallback in Empfangsrichtung. Unerwartete oder im falschen
//! Zustand gesendete Nachrichten trennen den einzelnen Verursacher.
//!
//! Zusaetzlich laufen hier die Glue-Tasks der Control-Plane: die
//! Konsumenten der `tcp_transmit`- und `request_sync`-Kanaele aus dem
//! UDP-Worker.

use sprechfunk_core::{AccountId, Result, SessionId, SprechfunkError};
use sprechfunk_protocol::control::{
    block_dekodieren, bytes_kodieren, ControlMessage, RejectGrund,
};
use sprechfunk_protocol::datagram::{klartext_parsen, voice_header_parsen, DatagramTyp};
use sprechfunk_voice::{Session, SessionZustand};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::server_state::SignalingState;

/// Verarbeitet eine einzelne Control-Nachricht einer Verbindung
///
/// Ein `Err` bedeutet: die Verbindung wird getrennt (nur der Verursacher).
pub async fn nachricht_verarbeiten(
    state: &Arc<SignalingState>,
    session: &Arc<Session>,
    nachricht: ControlMessage,
) -> Result<()> {
    tracing::trace!(session = %session.id, nachricht = nachricht.name(), "Control-Nachricht");

    match nachricht {
        ControlMessage::Authenticate { username, password } => {
            authentifizieren(state, session, &username, &password)
        }

        ControlMessage::Ping { timestamp_ms } => {
            state
                .broadcaster
                .an_session(&session.id, ControlMessage::Ping { timestamp_ms });
            Ok(())
        }

        ControlMessage::ChannelJoin { channel_id } => {
            authentifiziert_erforderlich(session)?;
            kanal_betreten(state, session, channel_id)
        }

        ControlMessage::SelfMuteDeaf { mute, deaf } => {
            authentifiziert_erforderlich(session)?;
            session.mute.store(mute, Ordering::Relaxed);
            session.self_deaf.store(deaf, Ordering::Relaxed);
            an_authentifizierte(
                state,
                None,
                ControlMessage::UserState {
                    session_id: session.id,
                    mute,
                    deaf,
                    suppressed: session.suppressed.load(Ordering::Relaxed),
                },
            );
            Ok(())
        }

        ControlMessage::CryptSync { client_nonce } => match client_nonce {
            // Client meldet seine Encrypt-IV: als Decrypt-IV uebernehmen
            Some(nonce) => {
                let block = block_dekodieren(&nonce).ok_or_else(|| {
                    SprechfunkError::UngueltigeNachricht("CryptSync-Nonce unlesbar".into())
                })?;
                session.crypt().decrypt_iv_setzen(block);
                tracing::debug!(session = %session.id, "Decrypt-IV per CryptSync uebernommen");
                Ok(())
            }
            // Client bittet um die Server-Sicht: Encrypt-IV zuruecksenden
            None => {
                let nonce = bytes_kodieren(&session.crypt().encrypt_iv());
                state.broadcaster.an_session(
                    &session.id,
                    ControlMessage::CryptSync {
                        client_nonce: Some(nonce),
                    },
                );
                Ok(())
            }
        },

        // TCP-Fallback in Empfangsrichtung: Clients ohne UDP-Pfad schicken
        // ihre Voice-Frames als Klartext ueber den Control-Stream
        ControlMessage::Voice { frame } => {
            authentifiziert_erforderlich(session)?;
            let Some((typ, eingebettet, payload)) = klartext_parsen(&frame) else {
                return Err(SprechfunkError::UngueltigeNachricht(
                    "Voice-Fallback-Frame unlesbar".into(),
                ));
            };
            if typ != DatagramTyp::Voice || eingebettet != session.id {
                return Err(SprechfunkError::UngueltigeNachricht(
                    "Voice-Fallback-Frame inkonsistent".into(),
                ));
            }
            let Some((header, _)) = voice_header_parsen(payload) else {
                return Err(SprechfunkError::UngueltigeNachricht(
                    "Voice-Header unlesbar".into(),
                ));
            };
            state.router.weiterleiten(session, header, &frame).await;
            Ok(())
        }

        // Alles andere ist Server->Client-Vokabular; ein Client der es
        // sendet fliegt raus
        sonstige => Err(SprechfunkError::UngueltigeNachricht(format!(
            "Unerwartete Nachricht: {}",
            sonstige.name()
        ))),
    }
}

fn authentifiziert_erforderlich(session: &Session) -> Result<()> {
    if session.ist_authentifiziert() {
        Ok(())
    } else {
        Err(SprechfunkError::Authentifizierung(
            "Nachricht vor der Authentifizierung".into(),
        ))
    }
}

/// Sendet eine Nachricht an alle authentifizierten Sessions
fn an_authentifizierte(
    state: &SignalingState,
    ausser: Option<SessionId>,
    nachricht: ControlMessage,
) {
    state.tabelle.fuer_alle_authentifizierten(|s| {
        if Some(s.id) != ausser {
            state.broadcaster.an_session(&s.id, nachricht.clone());
        }
    });
}

// ---------------------------------------------------------------------------
// Authentifizierung
// ---------------------------------------------------------------------------

fn authentifizieren(
    state: &Arc<SignalingState>,
    session: &Arc<Session>,
    username: &str,
    password: &str,
) -> Result<()> {
    if session.zustand() != SessionZustand::Verbunden {
        return Err(SprechfunkError::UngueltigeNachricht(
            "Doppelte Authentifizierung".into(),
        ));
    }

    if !state.konfig.spielername_gueltig(username) {
        state.broadcaster.an_session(
            &session.id,
            ControlMessage::Reject {
                grund: RejectGrund::InvalidName,
                nachricht: format!("Ungueltiger Name: '{username}'"),
            },
        );
        return Err(SprechfunkError::Authentifizierung(format!(
            "Ungueltiger Name: '{username}'"
        )));
    }

    if !state.konfig.passwort_pruefen(password) {
        state.broadcaster.an_session(
            &session.id,
            ControlMessage::Reject {
                grund: RejectGrund::WrongPassword,
                nachricht: "Falsches Server-Passwort".into(),
            },
        );
        return Err(SprechfunkError::Authentifizierung(
            "Falsches Server-Passwort".into(),
        ));
    }

    session.name_setzen(username);
    session.konto_setzen(AccountId(state.konto_vergeben()));

    // Schluesselmaterial fuer das UDP-Envelope erzeugen
    let (schluessel, server_nonce, client_nonce) = {
        let mut crypt = session.crypt();
        crypt.schluessel_erzeugen();
        (crypt.schluessel(), crypt.encrypt_iv(), crypt.decrypt_iv())
    };

    session.zustand_setzen(SessionZustand::Authentifiziert);

    // Standard-Kanal betreten; faellt auf die Wurzel zurueck wenn der
    // konfigurierte Kanal nicht (mehr) existiert
    let mut kanal = state.konfig.standard_kanal();
    if !state.kanaele.existiert(kanal) {
        tracing::warn!(kanal = %kanal, "Standard-Kanal existiert nicht, Wurzel verwendet");
        kanal = sprechfunk_core::ChannelId::WURZEL;
    }
    state.kanaele.betreten(session.id, kanal)?;
    session.kanal_setzen(kanal);
    unterdrueckung_anpassen(state, session, kanal);

    state.broadcaster.an_session(
        &session.id,
        ControlMessage::Welcome {
            session_id: session.id,
            account_id: session.konto(),
            willkommenstext: state.konfig.willkommenstext(),
            max_bandbreite: state.konfig.max_bandbreite(),
        },
    );
    state.broadcaster.an_session(
        &session.id,
        ControlMessage::CryptSetup {
            schluessel: bytes_kodieren(&schluessel),
            server_nonce: bytes_kodieren(&server_nonce),
            client_nonce: bytes_kodieren(&client_nonce),
        },
    );

    an_authentifizierte(
        state,
        Some(session.id),
        ControlMessage::ServerJoin {
            session_id: session.id,
            name: username.to_string(),
        },
    );
    an_authentifizierte(
        state,
        Some(session.id),
        ControlMessage::ChannelJoined {
            session_id: session.id,
            channel_id: kanal,
        },
    );

    tracing::info!(
        session = %session.id,
        name = username,
        konto = %session.konto(),
        kanal = %kanal,
        "Session authentifiziert"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Kanalwechsel
// ---------------------------------------------------------------------------

fn kanal_betreten(
    state: &Arc<SignalingState>,
    session: &Arc<Session>,
    kanal: sprechfunk_core::ChannelId,
) -> Result<()> {
    if !state.kanaele.existiert(kanal) {
        return Err(SprechfunkError::KanalNichtGefunden(kanal.inner()));
    }

    let darf = state.acl.hat_berechtigung(
        session.id,
        session.konto(),
        kanal,
        sprechfunk_channels::Permission::Enter,
    );
    if !darf {
        state.broadcaster.an_session(
            &session.id,
            ControlMessage::Reject {
                grund: RejectGrund::PermissionDenied,
                nachricht: format!("Kein Zutritt zu {kanal}"),
            },
        );
        tracing::debug!(session = %session.id, kanal = %kanal, "Kanalwechsel verweigert");
        return Ok(());
    }

    state.kanaele.betreten(session.id, kanal)?;
    session.kanal_setzen(kanal);
    // Berechtigungen sind kanal-bezogen gecacht
    state.acl.cache_leeren_fuer(session.id);
    unterdrueckung_anpassen(state, session, kanal);

    an_authentifizierte(
        state,
        None,
        ControlMessage::ChannelJoined {
            session_id: session.id,
            channel_id: kanal,
        },
    );
    Ok(())
}

/// Gleicht das serverseitige Suppressed-Flag mit der Speak-Berechtigung
/// im neuen Kanal ab und verteilt die Aenderung
fn unterdrueckung_anpassen(
    state: &Arc<SignalingState>,
    session: &Arc<Session>,
    kanal: sprechfunk_core::ChannelId,
) {
    if session.mute.load(Ordering::Relaxed) {
        return;
    }

    let darf_sprechen = state.acl.hat_berechtigung(
        session.id,
        session.konto(),
        kanal,
        sprechfunk_channels::Permission::Speak,
    );
    let unterdrueckt = session.suppressed.load(Ordering::Relaxed);
    if darf_sprechen == unterdrueckt {
        session.suppressed.store(!darf_sprechen, Ordering::Relaxed);
        an_authentifizierte(
            state,
            None,
            ControlMessage::UserState {
                session_id: session.id,
                mute: session.mute.load(Ordering::Relaxed),
                deaf: session.deaf.load(Ordering::Relaxed),
                suppressed: !darf_sprechen,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Glue-Tasks: Hand-offs vom UDP-Worker
// ---------------------------------------------------------------------------

/// Konsumiert die `tcp_transmit`- und `request_sync`-Kanaele
///
/// `tcp_transmit`: Voice-Frames fuer Empfaenger ohne UDP-Pfad, werden in
/// deren Control-Send-Queues eingereiht. `request_sync`: gedrosselte
/// Resync-Anfragen des UDP-Workers, werden als leere `CryptSync`
/// zugestellt.
pub async fn control_plane_lauf(
    state: Arc<SignalingState>,
    mut tcp_rx: mpsc::Receiver<(SessionId, ControlMessage)>,
    mut sync_rx: mpsc::Receiver<SessionId>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            eintrag = tcp_rx.recv() => {
                let Some((session_id, nachricht)) = eintrag else { break };
                state.broadcaster.an_session(&session_id, nachricht);
            }

            eintrag = sync_rx.recv() => {
                let Some(session_id) = eintrag else { break };
                if let Some(session) = state.tabelle.nach_id(session_id) {
                    tracing::info!(session = %session.id, "Crypt-Nonce-Resync angefordert");
                    state.broadcaster.an_session(
                        &session_id,
                        ControlMessage::CryptSync { client_nonce: None },
                    );
                }
            }

            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Control-Plane-Glue beendet");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
