// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transparent at-rest encryption of `password`/`secret` leaves in the local
//! YAML document.
//!
//! This is not a real security boundary: the key below is compiled into
//! every probe and is not a secret. It only prevents casual shoulder-reading
//! of the configuration file (§4.3 / Non-goals).

use base64::{Engine, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use thiserror::Error;

const FIELD_KEY_BYTES: [u8; 32] = [
    0x8e, 0x1f, 0x2a, 0x7b, 0x3c, 0x9d, 0x4e, 0x5f, 0x60, 0x71, 0x82, 0x93, 0xa4, 0xb5,
    0xc6, 0xd7, 0xe8, 0xf9, 0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f, 0x60, 0x71, 0x82, 0x93,
    0xa4, 0xb5, 0xc6, 0xd7,
];

static CIPHER: Lazy<ChaCha20Poly1305> =
    Lazy::new(|| ChaCha20Poly1305::new(Key::from_slice(&FIELD_KEY_BYTES)));

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64 token: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext too short to contain a nonce")]
    ShortCiphertext,
    #[error("decryption failed (corrupt or foreign token)")]
    Decrypt,
    #[error("decrypted value was not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypts `plain` and returns `base64(nonce || ciphertext)`, the on-disk
/// representation of a sensitive field.
pub fn encrypt_str(plain: &str) -> String {
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    // CIPHER.encrypt only fails on buffer-too-large, which cannot happen for
    // config-sized strings.
    let ciphertext = CIPHER
        .encrypt(&nonce, plain.as_bytes())
        .expect("field encryption cannot fail for in-memory buffers");

    let mut token = Vec::with_capacity(nonce.len() + ciphertext.len());
    token.extend_from_slice(&nonce);
    token.extend_from_slice(&ciphertext);
    STANDARD.encode(token)
}

/// Reverses [`encrypt_str`].
pub fn decrypt_str(token: &str) -> Result<String, CryptoError> {
    let raw = STANDARD.decode(token)?;
    if raw.len() < 12 {
        return Err(CryptoError::ShortCiphertext);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plain = CIPHER.decrypt(nonce, ciphertext).map_err(|_| CryptoError::Decrypt)?;
    Ok(String::from_utf8(plain)?)
}

/// Recursively encrypts every plain-string `password`/`secret` leaf in
/// `map`, replacing it with `{encrypted: <token>}`. Returns whether anything
/// changed, so the caller knows whether to rewrite the file.
pub fn encrypt_tree(map: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    for (k, v) in map.iter_mut() {
        let is_sensitive_key = k == "password" || k == "secret";
        if is_sensitive_key && v.is_string() {
            let plain = v.as_str().unwrap_or_default().to_string();
            *v = serde_json::json!({ "encrypted": encrypt_str(&plain) });
            changed = true;
        } else if let Value::Array(items) = v {
            for item in items.iter_mut() {
                if let Value::Object(obj) = item {
                    changed |= encrypt_tree(obj);
                }
            }
        } else if let Value::Object(obj) = v {
            changed |= encrypt_tree(obj);
        }
    }
    changed
}

/// Recursively decrypts every `{encrypted: <token>}` leaf under a
/// `password`/`secret` key in `map`, replacing it with the plain string.
/// A sensitive key whose value isn't a recognized encrypted token is left
/// untouched rather than erroring (matches the tolerant behavior of the
/// reference encoder this was ported from).
pub fn decrypt_tree(map: &mut Map<String, Value>) -> Result<(), CryptoError> {
    for (k, v) in map.iter_mut() {
        let is_sensitive_key = k == "password" || k == "secret";
        if is_sensitive_key && v.is_object() {
            if let Value::Object(enc) = v
                && let Some(Value::String(token)) = enc.get("encrypted")
            {
                *v = Value::String(decrypt_str(token)?);
            }
            continue;
        }
        match v {
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::Object(obj) = item {
                        decrypt_tree(obj)?;
                    }
                }
            },
            Value::Object(obj) => decrypt_tree(obj)?,
            _ => {},
        }
    }
    Ok(())
}
