//! Encrypting socket decorator with live key rotation.
//!
//! Outbound bytes are cut into segments of at most [`MAX_SEGMENT`] bytes and
//! each segment is sealed under a fresh random IV:
//!
//! ```text
//! frame     = [version: u8][length: u32 BE][iv][ciphertext]
//! plaintext = [kind: u8][payload]
//! ```
//!
//! `kind` 0 carries application bytes. `kind` 1 is a key-change notice whose
//! payload is an optional label (`[has_label: u8][utf-8 label]`).
//!
//! A new key takes effect at the next frame boundary: the sender seals one
//! notice under the old key and everything after it under the new one. The
//! receiver reports the notice to its listeners, then opens every later frame
//! with whatever key is active once the listeners return. Any frame that fails
//! to open closes the socket.

use crate::socket::{Socket, READ_CHUNK};
use crate::{WireError, WireResult};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use kgr_security::{
    Cipher, Crypto, Key, KeyChange, KeyChangeListener, Listeners, Random, SecurityResult,
    SocketEncryption, Subscription,
};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Largest plaintext carried by one frame.
pub const MAX_SEGMENT: usize = 64 * 1024;

const FRAME_VERSION: u8 = 1;
const FRAME_HEADER: usize = 5;
const KIND_DATA: u8 = 0;
const KIND_KEY_CHANGE: u8 = 1;

/// Room for the kind byte, IV and authentication tag.
const SEAL_OVERHEAD: usize = 256;

struct KeyState {
    default: Key,
    active: Key,
    active_cipher: Arc<dyn Cipher>,
    outbound: Arc<dyn Cipher>,
    inbound: Arc<dyn Cipher>,
    /// Label of a key change not yet announced to the peer.
    notice: Option<Option<String>>,
}

struct ReadState {
    sealed: BytesMut,
    plain: BytesMut,
}

/// A [`Socket`] that encrypts everything it carries.
pub struct CryptoSocket {
    inner: Arc<dyn Socket>,
    crypto: Arc<dyn Crypto>,
    keys: Mutex<KeyState>,
    random: Mutex<Box<dyn Random>>,
    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<()>,
    listeners: Listeners<KeyChange>,
    this: Weak<CryptoSocket>,
}

impl CryptoSocket {
    /// Wrap `inner`, sealing with `default_key` until another key is set.
    pub fn new(
        inner: Arc<dyn Socket>,
        crypto: Arc<dyn Crypto>,
        default_key: Key,
    ) -> WireResult<Arc<Self>> {
        let cipher: Arc<dyn Cipher> = Arc::from(crypto.new_cipher(&default_key)?);
        let random = crypto.new_random();
        Ok(Arc::new_cyclic(|this| Self {
            inner,
            keys: Mutex::new(KeyState {
                default: default_key.clone(),
                active: default_key,
                active_cipher: Arc::clone(&cipher),
                outbound: Arc::clone(&cipher),
                inbound: cipher,
                notice: None,
            }),
            crypto,
            random: Mutex::new(random),
            reader: tokio::sync::Mutex::new(ReadState {
                sealed: BytesMut::new(),
                plain: BytesMut::new(),
            }),
            writer: tokio::sync::Mutex::new(()),
            listeners: Listeners::new(),
            this: this.clone(),
        }))
    }

    /// Send a pending key-change notice now instead of with the next write.
    pub async fn flush(&self) -> WireResult<()> {
        self.write(&[]).await
    }

    fn keys(&self) -> std::sync::MutexGuard<'_, KeyState> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn seal(
        &self,
        cipher: &dyn Cipher,
        kind: u8,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> WireResult<()> {
        let mut iv = vec![0u8; cipher.iv_size()];
        self.random
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fill(&mut iv);
        let mut plain = Vec::with_capacity(1 + payload.len());
        plain.push(kind);
        plain.extend_from_slice(payload);
        let sealed = cipher.encrypt(&plain, &iv)?;

        let len = (iv.len() + sealed.len()) as u32;
        out.push(FRAME_VERSION);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(())
    }

    /// Open the next complete frame in `sealed`, if there is one.
    fn open(&self, sealed: &mut BytesMut) -> WireResult<Option<(u8, Vec<u8>)>> {
        if sealed.len() < FRAME_HEADER {
            return Ok(None);
        }
        if sealed[0] != FRAME_VERSION {
            return Err(WireError::VersionMismatch {
                local: FRAME_VERSION,
                remote: sealed[0],
            });
        }
        let len = u32::from_be_bytes([sealed[1], sealed[2], sealed[3], sealed[4]]) as usize;
        if len > MAX_SEGMENT + SEAL_OVERHEAD {
            return Err(WireError::MessageTooLarge {
                size: len as u32,
                max: (MAX_SEGMENT + SEAL_OVERHEAD) as u32,
            });
        }
        if sealed.len() < FRAME_HEADER + len {
            return Ok(None);
        }
        sealed.advance(FRAME_HEADER);
        let body = sealed.split_to(len);

        let cipher = Arc::clone(&self.keys().inbound);
        let iv_size = cipher.iv_size();
        if body.len() < iv_size {
            return Err(WireError::Protocol("frame shorter than its IV".to_string()));
        }
        let (iv, ciphertext) = body.split_at(iv_size);
        let mut plain = cipher.decrypt(ciphertext, iv)?;
        if plain.is_empty() {
            return Err(WireError::Protocol("frame without a kind byte".to_string()));
        }
        let kind = plain.remove(0);
        Ok(Some((kind, plain)))
    }

    fn key_change_received(&self, payload: &[u8]) -> WireResult<()> {
        let label = match payload.split_first() {
            Some((0, _)) => None,
            Some((1, label)) => Some(
                String::from_utf8(label.to_vec())
                    .map_err(|_| WireError::Protocol("key change label is not UTF-8".to_string()))?,
            ),
            _ => return Err(WireError::Protocol("malformed key change notice".to_string())),
        };
        debug!(label = ?label, "KGR: peer switched keys");
        self.listeners.emit(&KeyChange { label });
        let mut keys = self.keys();
        let active = Arc::clone(&keys.active_cipher);
        keys.inbound = active;
        Ok(())
    }

    async fn fail(&self, error: WireError) -> WireError {
        warn!(error = %error, "KGR: closing encrypted socket");
        self.inner.close().await;
        error
    }
}

#[async_trait]
impl Socket for CryptoSocket {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    async fn read(&self, max: usize) -> WireResult<Vec<u8>> {
        let mut state = self.reader.lock().await;
        loop {
            if !state.plain.is_empty() {
                let n = max.max(1).min(state.plain.len());
                return Ok(state.plain.split_to(n).to_vec());
            }
            let ReadState { sealed, plain } = &mut *state;
            match self.open(sealed) {
                Ok(Some((KIND_DATA, payload))) => plain.extend_from_slice(&payload),
                Ok(Some((KIND_KEY_CHANGE, payload))) => {
                    if let Err(e) = self.key_change_received(&payload) {
                        return Err(self.fail(e).await);
                    }
                }
                Ok(Some((kind, _))) => {
                    let e = WireError::Protocol(format!("unknown frame kind {kind}"));
                    return Err(self.fail(e).await);
                }
                Ok(None) => {
                    let bytes = self.inner.read(READ_CHUNK).await?;
                    if bytes.is_empty() {
                        if !sealed.is_empty() {
                            debug!(pending = sealed.len(), "KGR: stream ended mid-frame");
                        }
                        return Ok(Vec::new());
                    }
                    sealed.extend_from_slice(&bytes);
                }
                Err(e) => return Err(self.fail(e).await),
            }
        }
    }

    async fn write(&self, data: &[u8]) -> WireResult<()> {
        let _guard = self.writer.lock().await;
        let (notice, previous, current) = {
            let mut keys = self.keys();
            match keys.notice.take() {
                Some(label) => {
                    let active = Arc::clone(&keys.active_cipher);
                    let previous = std::mem::replace(&mut keys.outbound, Arc::clone(&active));
                    (Some(label), previous, active)
                }
                None => (None, Arc::clone(&keys.outbound), Arc::clone(&keys.outbound)),
            }
        };
        if notice.is_none() && data.is_empty() {
            return Ok(());
        }

        let mut out = Vec::with_capacity(data.len() + SEAL_OVERHEAD);
        if let Some(label) = notice {
            let mut payload = Vec::new();
            match label {
                Some(label) => {
                    payload.push(1);
                    payload.extend_from_slice(label.as_bytes());
                }
                None => payload.push(0),
            }
            self.seal(previous.as_ref(), KIND_KEY_CHANGE, &payload, &mut out)?;
        }
        for segment in data.chunks(MAX_SEGMENT) {
            self.seal(current.as_ref(), KIND_DATA, segment, &mut out)?;
        }
        self.inner.write(&out).await
    }

    /// Ready when decrypted bytes are buffered or the underlying socket has
    /// bytes. Those bytes may still be a partial frame.
    async fn wait(&self, timeout: Duration) -> bool {
        if let Ok(state) = self.reader.try_lock() {
            if !state.plain.is_empty() {
                return true;
            }
        }
        self.inner.wait(timeout).await
    }

    fn encryption(&self) -> Option<Arc<dyn SocketEncryption>> {
        self.this
            .upgrade()
            .map(|this| this as Arc<dyn SocketEncryption>)
    }
}

impl SocketEncryption for CryptoSocket {
    fn encryption_key(&self) -> Key {
        self.keys().active.clone()
    }

    fn set_encryption_key(&self, key: Key, label: Option<String>) -> SecurityResult<()> {
        let cipher: Arc<dyn Cipher> = Arc::from(self.crypto.new_cipher(&key)?);
        let mut keys = self.keys();
        keys.active = key;
        keys.active_cipher = cipher;
        keys.notice = Some(label);
        Ok(())
    }

    fn restore_default_key(&self, label: Option<String>) -> SecurityResult<()> {
        let default = self.keys().default.clone();
        self.set_encryption_key(default, label)
    }

    fn on_key_change(&self, listener: KeyChangeListener) -> Subscription {
        self.listeners.subscribe(move |change| listener(change))
    }
}
