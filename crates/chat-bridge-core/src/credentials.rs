//! Session credential material.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signer, SigningKey};
use rand::{Rng, RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::value::{StoredValue, buffer};

/// Key under which the credential record is stored.
pub const CREDS_KEY: &str = "creds";

/// Public/private key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "buffer")]
    pub private: Vec<u8>,
    #[serde(with = "buffer")]
    pub public: Vec<u8>,
}

impl KeyPair {
    /// Generate an X25519 key pair.
    #[must_use]
    pub fn generate_x25519() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private: secret.to_bytes().to_vec(),
            public: public.as_bytes().to_vec(),
        }
    }

    /// Generate an Ed25519 signing key pair.
    #[must_use]
    pub fn generate_ed25519() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            private: signing.to_bytes().to_vec(),
            public: signing.verifying_key().to_bytes().to_vec(),
        }
    }

    fn signing_key(&self) -> Option<SigningKey> {
        let bytes: [u8; 32] = self.private.as_slice().try_into().ok()?;
        Some(SigningKey::from_bytes(&bytes))
    }
}

/// Key pair whose public half is signed by the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedKeyPair {
    pub key_pair: KeyPair,
    #[serde(with = "buffer")]
    pub signature: Vec<u8>,
    pub key_id: u32,
}

impl SignedKeyPair {
    fn generate(identity: &KeyPair, key_id: u32) -> Self {
        let key_pair = KeyPair::generate_x25519();
        let signature = identity
            .signing_key()
            .map(|key| key.sign(&key_pair.public).to_bytes().to_vec())
            .unwrap_or_default();
        Self {
            key_pair,
            signature,
            key_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettings {
    #[serde(default)]
    pub unarchive_chats: bool,
}

/// The authenticated account, once paired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Long-term identity and key data needed to resume a session without a
/// fresh registration handshake.
///
/// Field names follow the camelCase layout of existing stored records.
/// Fields this type does not model are kept in `extra` and written back
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedKeyPair,
    pub registration_id: u16,
    pub adv_secret_key: String,
    #[serde(default)]
    pub processed_history_messages: Vec<StoredValue>,
    #[serde(default)]
    pub next_pre_key_id: u32,
    #[serde(default)]
    pub first_unuploaded_pre_key_id: u32,
    #[serde(default)]
    pub account_sync_counter: u32,
    #[serde(default)]
    pub account_settings: AccountSettings,
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Contact>,
    #[serde(
        default,
        with = "buffer::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub routing_info: Option<Vec<u8>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, StoredValue>,
}

impl Credentials {
    /// Synthesize fresh, unregistered credential material.
    #[must_use]
    pub fn generate() -> Self {
        let signed_identity_key = KeyPair::generate_ed25519();
        let signed_pre_key = SignedKeyPair::generate(&signed_identity_key, 1);

        let mut adv_secret = [0u8; 32];
        OsRng.fill_bytes(&mut adv_secret);

        Self {
            noise_key: KeyPair::generate_x25519(),
            pairing_ephemeral_key_pair: KeyPair::generate_x25519(),
            signed_identity_key,
            signed_pre_key,
            registration_id: OsRng.r#gen::<u16>() & 0x3fff,
            adv_secret_key: BASE64.encode(adv_secret),
            processed_history_messages: Vec::new(),
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            account_sync_counter: 0,
            account_settings: AccountSettings::default(),
            registered: false,
            pairing_code: None,
            me: None,
            routing_info: None,
            extra: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    use super::*;

    #[test]
    fn test_generate_shapes() {
        let creds = Credentials::generate();
        assert_eq!(creds.noise_key.private.len(), 32);
        assert_eq!(creds.noise_key.public.len(), 32);
        assert_eq!(creds.signed_pre_key.signature.len(), 64);
        assert!(creds.registration_id <= 0x3fff);
        assert_eq!(BASE64.decode(&creds.adv_secret_key).unwrap().len(), 32);
        assert!(!creds.registered);
        assert_ne!(creds.noise_key, creds.pairing_ephemeral_key_pair);
    }

    #[test]
    fn test_pre_key_signature_verifies() {
        let creds = Credentials::generate();
        let public: [u8; 32] = creds.signed_identity_key.public.as_slice().try_into().unwrap();
        let verifying = VerifyingKey::from_bytes(&public).unwrap();
        let signature = Signature::from_slice(&creds.signed_pre_key.signature).unwrap();
        verifying
            .verify(&creds.signed_pre_key.key_pair.public, &signature)
            .unwrap();
    }

    #[test]
    fn test_stored_roundtrip_keeps_unknown_fields() {
        let mut creds = Credentials::generate();
        creds.me = Some(Contact {
            id: "5511999999999@s.whatsapp.net".to_string(),
            name: None,
        });
        creds.routing_info = Some(vec![8, 9, 10]);
        creds
            .extra
            .insert("lastPropHash".to_string(), StoredValue::from("abc"));

        let stored = StoredValue::from_serializable(&creds).unwrap();
        assert_eq!(
            stored.get("noiseKey").and_then(|k| k.get("private")).and_then(StoredValue::as_bytes),
            Some(creds.noise_key.private.as_slice())
        );

        let back: Credentials = stored.deserialize_into().unwrap();
        assert_eq!(back, creds);
    }
}
