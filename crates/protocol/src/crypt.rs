//! Crypt-Envelope fuer UDP-Datagramme (OCB2/AES-128)
//!
//! Jedes Datagramm beginnt mit einem 4-Byte-Kopf:
//!
//! ```text
//! [IV-Low-Byte][Tag0][Tag1][Tag2][Ciphertext ...]
//! ```
//!
//! Der Ciphertext ist exakt so lang wie der Klartext; der Tag wird auf
//! drei Bytes gekuerzt. Pro Richtung laeuft eine 16-Byte-IV die mit jedem
//! Paket inkrementiert wird. Die Empfangsseite rekonstruiert die volle IV
//! aus dem Low-Byte und toleriert dabei verspaetete und verlorene Pakete
//! in einem Fenster von 30 Paketen; eine 256-Eintraege-History verhindert
//! Replays innerhalb des Fensters.
//!
//! Ein fehlgeschlagener Decrypt loest eine Resync-Anfrage aus, wenn seit
//! dem letzten erfolgreichen Decrypt UND seit der letzten Anfrage jeweils
//! mehr als 5 Sekunden vergangen sind.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;
use std::time::{Duration, Instant};

/// Schluessel- und Blockgroesse (AES-128)
pub const BLOCK_LAENGE: usize = 16;

/// Laenge des On-Wire-Kopfes
pub const KOPF_LAENGE: usize = 4;

/// Schwelle fuer die Resync-Drosselung
pub const RESYNC_SCHWELLE: Duration = Duration::from_secs(5);

/// Fenster in dem verspaetete Pakete noch akzeptiert werden
const SPAET_FENSTER: i32 = 30;

type Block = [u8; BLOCK_LAENGE];

// ---------------------------------------------------------------------------
// GF(2^128)-Hilfsfunktionen
// ---------------------------------------------------------------------------

#[inline]
fn xor_block(ziel: &mut Block, quelle: &Block) {
    for i in 0..BLOCK_LAENGE {
        ziel[i] ^= quelle[i];
    }
}

#[inline]
fn xor_slice(ziel: &mut Block, quelle: &[u8]) {
    for (z, q) in ziel.iter_mut().zip(quelle) {
        *z ^= q;
    }
}

/// Multiplikation mit 2 im GF(2^128) (Polynom x^128 + x^7 + x^2 + x + 1)
#[inline]
fn mal_zwei(block: &mut Block) {
    let uebertrag = block[0] >> 7;
    for i in 0..BLOCK_LAENGE - 1 {
        block[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[BLOCK_LAENGE - 1] = (block[BLOCK_LAENGE - 1] << 1) ^ (uebertrag * 0x87);
}

/// Multiplikation mit 3: x * 3 = (x * 2) ^ x
#[inline]
fn mal_drei(block: &mut Block) {
    let mut doppelt = *block;
    mal_zwei(&mut doppelt);
    xor_block(block, &doppelt);
}

#[inline]
fn aes_verschluesseln(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut ga);
    let mut aus = [0u8; BLOCK_LAENGE];
    aus.copy_from_slice(&ga);
    aus
}

#[inline]
fn aes_entschluesseln(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut ga);
    let mut aus = [0u8; BLOCK_LAENGE];
    aus.copy_from_slice(&ga);
    aus
}

// ---------------------------------------------------------------------------
// OCB2-Kern
// ---------------------------------------------------------------------------

fn ocb_verschluesseln(cipher: &Aes128, klartext: &[u8], ziel: &mut [u8], nonce: &Block) -> Block {
    debug_assert_eq!(klartext.len(), ziel.len());

    let mut delta = aes_verschluesseln(cipher, nonce);
    let mut pruefsumme = [0u8; BLOCK_LAENGE];

    // Alle Bloecke vor dem letzten (der letzte laeuft ueber den Pad-Stream)
    let volle = klartext.len().saturating_sub(1) / BLOCK_LAENGE;
    for b in 0..volle {
        let von = b * BLOCK_LAENGE;
        mal_zwei(&mut delta);
        let mut tmp = delta;
        xor_slice(&mut tmp, &klartext[von..von + BLOCK_LAENGE]);
        tmp = aes_verschluesseln(cipher, &tmp);
        for i in 0..BLOCK_LAENGE {
            ziel[von + i] = delta[i] ^ tmp[i];
        }
        xor_slice(&mut pruefsumme, &klartext[von..von + BLOCK_LAENGE]);
    }

    let rest = &klartext[volle * BLOCK_LAENGE..];
    mal_zwei(&mut delta);
    let mut laengen_block = [0u8; BLOCK_LAENGE];
    laengen_block[BLOCK_LAENGE - 4..].copy_from_slice(&((rest.len() * 8) as u32).to_be_bytes());
    xor_block(&mut laengen_block, &delta);
    let pad = aes_verschluesseln(cipher, &laengen_block);

    let mut letzter = [0u8; BLOCK_LAENGE];
    letzter[..rest.len()].copy_from_slice(rest);
    letzter[rest.len()..].copy_from_slice(&pad[rest.len()..]);
    xor_block(&mut pruefsumme, &letzter);
    xor_block(&mut letzter, &pad);
    ziel[volle * BLOCK_LAENGE..].copy_from_slice(&letzter[..rest.len()]);

    mal_drei(&mut delta);
    xor_block(&mut pruefsumme, &delta);
    aes_verschluesseln(cipher, &pruefsumme)
}

fn ocb_entschluesseln(cipher: &Aes128, ciphertext: &[u8], ziel: &mut [u8], nonce: &Block) -> Block {
    debug_assert_eq!(ciphertext.len(), ziel.len());

    let mut delta = aes_verschluesseln(cipher, nonce);
    let mut pruefsumme = [0u8; BLOCK_LAENGE];

    let volle = ciphertext.len().saturating_sub(1) / BLOCK_LAENGE;
    for b in 0..volle {
        let von = b * BLOCK_LAENGE;
        mal_zwei(&mut delta);
        let mut tmp = delta;
        xor_slice(&mut tmp, &ciphertext[von..von + BLOCK_LAENGE]);
        tmp = aes_entschluesseln(cipher, &tmp);
        for i in 0..BLOCK_LAENGE {
            ziel[von + i] = delta[i] ^ tmp[i];
        }
        xor_slice(&mut pruefsumme, &ziel[von..von + BLOCK_LAENGE]);
    }

    let rest = &ciphertext[volle * BLOCK_LAENGE..];
    mal_zwei(&mut delta);
    let mut laengen_block = [0u8; BLOCK_LAENGE];
    laengen_block[BLOCK_LAENGE - 4..].copy_from_slice(&((rest.len() * 8) as u32).to_be_bytes());
    xor_block(&mut laengen_block, &delta);
    let pad = aes_verschluesseln(cipher, &laengen_block);

    let mut letzter = [0u8; BLOCK_LAENGE];
    letzter[..rest.len()].copy_from_slice(rest);
    xor_block(&mut letzter, &pad);
    xor_block(&mut pruefsumme, &letzter);
    ziel[volle * BLOCK_LAENGE..].copy_from_slice(&letzter[..rest.len()]);

    mal_drei(&mut delta);
    xor_block(&mut pruefsumme, &delta);
    aes_verschluesseln(cipher, &pruefsumme)
}

// ---------------------------------------------------------------------------
// CryptState
// ---------------------------------------------------------------------------

/// Pro-Session-Zustand des Stream-Ciphers
///
/// Auf dem UDP-Pfad hat der Zustand genau einen logischen Schreiber
/// (den UDP-Worker); die Control-Seite liest nur und greift ueber
/// Message-Passing ein (Resync).
pub struct CryptState {
    cipher: Option<Aes128>,
    roh_schluessel: Block,
    encrypt_iv: Block,
    decrypt_iv: Block,
    decrypt_history: [u8; 256],

    /// Statistik: erfolgreich entschluesselte Pakete
    pub gute: u32,
    /// Statistik: verspaetet akzeptierte Pakete
    pub spaete: u32,
    /// Statistik: als verloren erkannte Pakete
    pub verlorene: u32,
    /// Statistik: gestellte Resync-Anfragen
    pub resyncs: u32,

    /// Zeitpunkt des letzten erfolgreichen Decrypts
    pub letzter_guter_empfang: Instant,
    /// Zeitpunkt der letzten Resync-Anfrage
    pub letzte_resync_anfrage: Instant,
}

impl CryptState {
    /// Erstellt einen Zustand ohne Schluessel (noch nicht verwendbar)
    pub fn neu() -> Self {
        let jetzt = Instant::now();
        Self {
            cipher: None,
            roh_schluessel: [0u8; BLOCK_LAENGE],
            encrypt_iv: [0u8; BLOCK_LAENGE],
            decrypt_iv: [0u8; BLOCK_LAENGE],
            decrypt_history: [0u8; 256],
            gute: 0,
            spaete: 0,
            verlorene: 0,
            resyncs: 0,
            letzter_guter_empfang: jetzt,
            letzte_resync_anfrage: jetzt,
        }
    }

    /// Prueft ob der Zustand einen Schluessel traegt
    pub fn ist_gueltig(&self) -> bool {
        self.cipher.is_some()
    }

    /// Erzeugt frisches Schluesselmaterial (Server-Seite)
    pub fn schluessel_erzeugen(&mut self) {
        let mut rng = rand::rngs::OsRng;
        rng.fill_bytes(&mut self.roh_schluessel);
        rng.fill_bytes(&mut self.encrypt_iv);
        rng.fill_bytes(&mut self.decrypt_iv);
        // History darf initial nie mit der aktuellen IV kollidieren
        self.decrypt_history = [self.decrypt_iv[1].wrapping_add(1); 256];
        self.cipher = Some(Aes128::new(GenericArray::from_slice(&self.roh_schluessel)));
    }

    /// Uebernimmt vorhandenes Schluesselmaterial (Client-Seite / Tests)
    pub fn schluessel_setzen(&mut self, schluessel: Block, encrypt_iv: Block, decrypt_iv: Block) {
        self.roh_schluessel = schluessel;
        self.encrypt_iv = encrypt_iv;
        self.decrypt_iv = decrypt_iv;
        self.decrypt_history = [self.decrypt_iv[1].wrapping_add(1); 256];
        self.cipher = Some(Aes128::new(GenericArray::from_slice(&schluessel)));
    }

    /// Gibt den rohen Schluessel zurueck (fuer CryptSetup)
    pub fn schluessel(&self) -> Block {
        self.roh_schluessel
    }

    /// Aktuelle Encrypt-IV (= Decrypt-IV der Gegenseite)
    pub fn encrypt_iv(&self) -> Block {
        self.encrypt_iv
    }

    /// Aktuelle Decrypt-IV (= Encrypt-IV der Gegenseite)
    pub fn decrypt_iv(&self) -> Block {
        self.decrypt_iv
    }

    /// Setzt die Decrypt-IV neu (Resync-Antwort des Clients)
    pub fn decrypt_iv_setzen(&mut self, iv: Block) {
        self.decrypt_iv = iv;
        self.decrypt_history = [self.decrypt_iv[1].wrapping_add(1); 256];
        self.resyncs += 1;
    }

    /// Verschluesselt einen Klartext-Frame in das On-Wire-Format
    ///
    /// Gibt `None` zurueck solange kein Schluessel gesetzt ist.
    pub fn verschluesseln(&mut self, klartext: &[u8]) -> Option<Vec<u8>> {
        if self.cipher.is_none() {
            return None;
        }

        // IV inkrementieren (Little-Endian-Uebertrag ueber alle 16 Bytes)
        for byte in self.encrypt_iv.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }

        let cipher = self.cipher.as_ref()?;
        let mut ziel = vec![0u8; KOPF_LAENGE + klartext.len()];
        let tag = ocb_verschluesseln(cipher, klartext, &mut ziel[KOPF_LAENGE..], &self.encrypt_iv);
        ziel[0] = self.encrypt_iv[0];
        ziel[1..KOPF_LAENGE].copy_from_slice(&tag[..3]);
        Some(ziel)
    }

    /// Entschluesselt ein On-Wire-Datagramm
    ///
    /// Rekonstruiert die volle IV aus dem Low-Byte; toleriert verspaetete
    /// und verlorene Pakete im Fenster, verwirft Replays und Pakete mit
    /// falschem Tag. `None` = still verwerfen (Resync-Politik separat).
    pub fn entschluesseln(&mut self, datagramm: &[u8]) -> Option<Vec<u8>> {
        if self.cipher.is_none() || datagramm.len() < KOPF_LAENGE {
            return None;
        }

        let iv_byte = datagramm[0];
        let gesichert = self.decrypt_iv;
        let mut wiederherstellen = false;
        let mut spaet = 0u32;
        let mut verloren = 0i64;

        if self.decrypt_iv[0].wrapping_add(1) == iv_byte {
            // Normalfall: das naechste Paket in Reihenfolge
            if iv_byte > self.decrypt_iv[0] {
                self.decrypt_iv[0] = iv_byte;
            } else {
                // Low-Byte ist uebergelaufen
                self.decrypt_iv[0] = iv_byte;
                iv_hochzaehlen(&mut self.decrypt_iv);
            }
        } else {
            // Verspaetet, verloren oder ausserhalb des Fensters
            let diff = i32::from(iv_byte.wrapping_sub(self.decrypt_iv[0]) as i8);

            if iv_byte < self.decrypt_iv[0] && (-SPAET_FENSTER..0).contains(&diff) {
                // Verspaetet, gleicher Zyklus
                spaet = 1;
                verloren = -1;
                self.decrypt_iv[0] = iv_byte;
                wiederherstellen = true;
            } else if iv_byte > self.decrypt_iv[0] && (-SPAET_FENSTER..0).contains(&diff) {
                // Verspaetet, voriger Zyklus
                spaet = 1;
                verloren = -1;
                self.decrypt_iv[0] = iv_byte;
                iv_runterzaehlen(&mut self.decrypt_iv);
                wiederherstellen = true;
            } else if iv_byte > self.decrypt_iv[0] && diff > 0 {
                // Pakete verloren, gleicher Zyklus
                verloren = i64::from(iv_byte) - i64::from(gesichert[0]) - 1;
                self.decrypt_iv[0] = iv_byte;
            } else if iv_byte < self.decrypt_iv[0] && diff > 0 {
                // Pakete verloren, Low-Byte uebergelaufen
                verloren = 256 - i64::from(gesichert[0]) + i64::from(iv_byte) - 1;
                self.decrypt_iv[0] = iv_byte;
                iv_hochzaehlen(&mut self.decrypt_iv);
            } else {
                return None;
            }

            if self.decrypt_history[self.decrypt_iv[0] as usize] == self.decrypt_iv[1] {
                self.decrypt_iv = gesichert;
                return None;
            }
        }

        let cipher = self.cipher.as_ref()?;
        let mut klartext = vec![0u8; datagramm.len() - KOPF_LAENGE];
        let tag = ocb_entschluesseln(cipher, &datagramm[KOPF_LAENGE..], &mut klartext, &self.decrypt_iv);
        if tag[..3] != datagramm[1..KOPF_LAENGE] {
            self.decrypt_iv = gesichert;
            return None;
        }
        self.decrypt_history[self.decrypt_iv[0] as usize] = self.decrypt_iv[1];

        if wiederherstellen {
            self.decrypt_iv = gesichert;
        }

        self.gute += 1;
        self.spaete += spaet;
        self.verlorene = (i64::from(self.verlorene) + verloren).max(0) as u32;
        self.letzter_guter_empfang = Instant::now();
        Some(klartext)
    }

    /// Prueft nach einem fehlgeschlagenen Decrypt ob eine Resync-Anfrage
    /// faellig ist; drosselt auf hoechstens eine Anfrage pro 5 Sekunden
    pub fn resync_faellig(&mut self) -> bool {
        if self.letzter_guter_empfang.elapsed() > RESYNC_SCHWELLE
            && self.letzte_resync_anfrage.elapsed() > RESYNC_SCHWELLE
        {
            self.letzte_resync_anfrage = Instant::now();
            self.resyncs += 1;
            return true;
        }
        false
    }
}

impl Default for CryptState {
    fn default() -> Self {
        Self::neu()
    }
}

#[inline]
fn iv_hochzaehlen(iv: &mut Block) {
    for byte in iv.iter_mut().skip(1) {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

#[inline]
fn iv_runterzaehlen(iv: &mut Block) {
    for byte in iv.iter_mut().skip(1) {
        let alt = *byte;
        *byte = byte.wrapping_sub(1);
        if alt != 0 {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
