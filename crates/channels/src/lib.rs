//! sprechfunk-channels – Kanalbaum und Zugriffskontrolle
//!
//! Der Voice-Kern behandelt Kanaele und ACLs als abfragbaren Store:
//! `tree` haelt die Kanal-Hierarchie, die Kanal-Links und die Insassen;
//! `acl` beantwortet Berechtigungsfragen ueber einen gecachten Lookup.

pub mod acl;
pub mod tree;

pub use acl::{AclStore, Permission};
pub use tree::ChannelTree;
