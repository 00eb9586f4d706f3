//! Protected-note encryption and session management.
//!
//! # Responsibility
//! - Convert notes between plaintext and encrypted-at-rest form.
//! - Own the lifecycle of the in-memory data key.

pub mod crypto;
pub mod session;

use crate::model::note::Note;
use crypto::{decrypt_bytes, decrypt_title, encrypt_bytes, encrypt_title, CryptoResult, DataKey};

/// Encrypts title and content in place and marks the note protected.
///
/// A note that is already protected is left untouched.
pub fn seal_note(note: &mut Note, key: &DataKey) -> CryptoResult<()> {
    if note.is_protected {
        return Ok(());
    }
    let title = encrypt_title(key, &note.title)?;
    let content = encrypt_bytes(key, &note.content)?;
    note.title = title;
    note.content = content;
    note.is_protected = true;
    Ok(())
}

/// Decrypts title and content in place and clears the protected flag.
///
/// A note that is not protected is left untouched.
pub fn open_note(note: &mut Note, key: &DataKey) -> CryptoResult<()> {
    if !note.is_protected {
        return Ok(());
    }
    let title = decrypt_title(key, &note.title)?;
    let content = decrypt_bytes(key, &note.content)?;
    note.title = title;
    note.content = content;
    note.is_protected = false;
    Ok(())
}
