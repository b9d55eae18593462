//! User-based security model for SNMPv3.
//!
//! Keys follow RFC 3414 (password to key, localization), authentication
//! covers HMAC-MD5/SHA-1 and the RFC 7860 SHA-2 family, privacy covers
//! DES-CBC and AES-CFB (RFC 3826). AES-192/256 keys are extended with the
//! Blumenthal scheme, the `C` variants with the Reeder scheme.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{AsyncStreamCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use hmac::{Hmac, Mac};
use md5::Md5;
use parking_lot::Mutex;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::ber::{
    Pdu, PduType, ScopedData, ScopedPdu, UsmParams, V3Message, FLAG_AUTH, FLAG_PRIV, FLAG_REPORTABLE,
};
use crate::config::{AuthProtocol, PrivProtocol, SecurityLevel};
use crate::error::TransportError;

const PASSWORD_STREAM: usize = 1_048_576;

/// Largest message this side accepts.
pub const MAX_MESSAGE_SIZE: i64 = 65_507;

const ENGINE_TIME_MAX: i64 = 2_147_483_647;

impl AuthProtocol {
    /// Length of the truncated HMAC carried in a message.
    pub fn mac_len(self) -> usize {
        match self {
            AuthProtocol::Md5 | AuthProtocol::Sha => 12,
            AuthProtocol::Sha224 => 16,
            AuthProtocol::Sha256 => 24,
            AuthProtocol::Sha384 => 32,
            AuthProtocol::Sha512 => 48,
        }
    }
}

impl PrivProtocol {
    /// Bytes of localized key material the cipher consumes. DES takes the
    /// key and the pre-IV from the same 16 bytes.
    pub fn key_len(self) -> usize {
        match self {
            PrivProtocol::Des | PrivProtocol::Aes => 16,
            PrivProtocol::Aes192 | PrivProtocol::Aes192C => 24,
            PrivProtocol::Aes256 | PrivProtocol::Aes256C => 32,
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn new(protocol: AuthProtocol) -> Self {
        match protocol {
            AuthProtocol::Md5 => Hasher::Md5(Md5::new()),
            AuthProtocol::Sha => Hasher::Sha1(Sha1::new()),
            AuthProtocol::Sha224 => Hasher::Sha224(Sha224::new()),
            AuthProtocol::Sha256 => Hasher::Sha256(Sha256::new()),
            AuthProtocol::Sha384 => Hasher::Sha384(Sha384::new()),
            AuthProtocol::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha224(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

fn digest(protocol: AuthProtocol, parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Hasher::new(protocol);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn hmac(protocol: AuthProtocol, key: &[u8], data: &[u8]) -> Result<Vec<u8>, TransportError> {
    fn run<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut mac = <M as KeyInit>::new_from_slice(key)
            .map_err(|_| TransportError::Security("invalid authentication key".into()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
    match protocol {
        AuthProtocol::Md5 => run::<Hmac<Md5>>(key, data),
        AuthProtocol::Sha => run::<Hmac<Sha1>>(key, data),
        AuthProtocol::Sha224 => run::<Hmac<Sha224>>(key, data),
        AuthProtocol::Sha256 => run::<Hmac<Sha256>>(key, data),
        AuthProtocol::Sha384 => run::<Hmac<Sha384>>(key, data),
        AuthProtocol::Sha512 => run::<Hmac<Sha512>>(key, data),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hash one megabyte of the repeated password.
pub fn password_to_key(protocol: AuthProtocol, password: &[u8]) -> Result<Vec<u8>, TransportError> {
    if password.is_empty() {
        return Err(TransportError::Security("empty USM password".into()));
    }
    let mut hasher = Hasher::new(protocol);
    let mut block = [0u8; 64];
    let mut index = 0;
    for _ in 0..PASSWORD_STREAM / block.len() {
        for b in block.iter_mut() {
            *b = password[index % password.len()];
            index += 1;
        }
        hasher.update(&block);
    }
    Ok(hasher.finalize())
}

/// Bind a user key to one authoritative engine.
pub fn localize(protocol: AuthProtocol, key: &[u8], engine_id: &[u8]) -> Vec<u8> {
    digest(protocol, &[key, engine_id, key])
}

fn privacy_key(
    auth: AuthProtocol,
    privacy: PrivProtocol,
    password: &[u8],
    engine_id: &[u8],
) -> Result<Vec<u8>, TransportError> {
    let needed = privacy.key_len();
    let mut key = localize(auth, &password_to_key(auth, password)?, engine_id);
    while key.len() < needed {
        let more = match privacy {
            PrivProtocol::Aes192C | PrivProtocol::Aes256C => {
                localize(auth, &password_to_key(auth, &key)?, engine_id)
            }
            _ => digest(auth, &[key.as_slice()]),
        };
        key.extend(more);
    }
    key.truncate(needed);
    Ok(key)
}

/// Localized keys of one user for one engine.
#[derive(Clone)]
pub struct UserKeys {
    auth: Option<(AuthProtocol, Vec<u8>)>,
    privacy: Option<(PrivProtocol, Vec<u8>)>,
}

impl fmt::Debug for UserKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKeys")
            .field("auth", &self.auth.as_ref().map(|(p, _)| p))
            .field("privacy", &self.privacy.as_ref().map(|(p, _)| p))
            .finish()
    }
}

impl UserKeys {
    /// Derive the keys for `engine_id`. Privacy needs authentication: its key
    /// is hashed with the authentication protocol.
    pub fn derive(
        auth: Option<(AuthProtocol, &str)>,
        privacy: Option<(PrivProtocol, &str)>,
        engine_id: &[u8],
    ) -> Result<Self, TransportError> {
        let auth_key = match auth {
            Some((protocol, password)) => Some((
                protocol,
                localize(protocol, &password_to_key(protocol, password.as_bytes())?, engine_id),
            )),
            None => None,
        };
        let privacy_material = match (privacy, auth) {
            (Some((protocol, password)), Some((auth_protocol, _))) => Some((
                protocol,
                privacy_key(auth_protocol, protocol, password.as_bytes(), engine_id)?,
            )),
            (Some(_), None) => {
                return Err(TransportError::Security("privacy requires authentication".into()))
            }
            (None, _) => None,
        };
        Ok(Self {
            auth: auth_key,
            privacy: privacy_material,
        })
    }

    /// Write the truncated HMAC of `packet` over its zeroed authentication
    /// parameters at `at`.
    pub fn sign(&self, packet: &mut [u8], at: usize) -> Result<(), TransportError> {
        let Some((protocol, key)) = &self.auth else {
            return Err(TransportError::Security("no authentication key".into()));
        };
        let len = protocol.mac_len();
        let slot = packet
            .get_mut(at..at + len)
            .ok_or_else(|| TransportError::Encode("authentication parameters out of range".into()))?;
        slot.fill(0);
        let mac = hmac(*protocol, key, packet)?;
        packet[at..at + len].copy_from_slice(&mac[..len]);
        Ok(())
    }

    /// Check the HMAC of a received packet whose authentication parameters
    /// start at `at`.
    pub fn verify(&self, packet: &[u8], at: usize, received: &[u8]) -> Result<(), TransportError> {
        let Some((protocol, key)) = &self.auth else {
            return Err(TransportError::Security("no authentication key".into()));
        };
        let len = protocol.mac_len();
        if received.len() != len || packet.len() < at + len {
            return Err(TransportError::Security(format!(
                "authentication parameters must be {} bytes, found {}",
                len,
                received.len()
            )));
        }
        let mut zeroed = packet.to_vec();
        zeroed[at..at + len].fill(0);
        let mac = hmac(*protocol, key, &zeroed)?;
        if constant_time_eq(&mac[..len], received) {
            Ok(())
        } else {
            Err(TransportError::Security("wrong message digest".into()))
        }
    }

    /// Encrypt a scoped PDU. Returns the ciphertext and the privacy
    /// parameters (the salt) to send with it.
    pub fn encrypt(&self, plain: &[u8], boots: i64, time: i64, salt: u64) -> Result<(Vec<u8>, Vec<u8>), TransportError> {
        let Some((protocol, key)) = &self.privacy else {
            return Err(TransportError::Security("no privacy key".into()));
        };
        let cipher_error = |e: &dyn fmt::Debug| TransportError::Security(format!("encryption failed: {:?}", e));
        match protocol {
            PrivProtocol::Des => {
                let mut params = (boots as u32).to_be_bytes().to_vec();
                params.extend((salt as u32).to_be_bytes());
                let iv: Vec<u8> = key[8..16].iter().zip(&params).map(|(a, b)| a ^ b).collect();
                let mut buf = plain.to_vec();
                buf.resize(plain.len().div_ceil(8) * 8, 0);
                let len = buf.len();
                cbc::Encryptor::<des::Des>::new_from_slices(&key[..8], &iv)
                    .map_err(|e| cipher_error(&e))?
                    .encrypt_padded_mut::<NoPadding>(&mut buf, len)
                    .map_err(|e| cipher_error(&e))?;
                Ok((buf, params))
            }
            _ => {
                let params = salt.to_be_bytes().to_vec();
                let iv = aes_iv(boots, time, &params);
                let mut buf = plain.to_vec();
                match key.len() {
                    16 => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, &iv).map(|c| c.encrypt(&mut buf)),
                    24 => cfb_mode::Encryptor::<Aes192>::new_from_slices(key, &iv).map(|c| c.encrypt(&mut buf)),
                    _ => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, &iv).map(|c| c.encrypt(&mut buf)),
                }
                .map_err(|e| cipher_error(&e))?;
                Ok((buf, params))
            }
        }
    }

    /// Decrypt an encrypted scoped PDU sent with `params` by an engine at
    /// `boots`/`time`.
    pub fn decrypt(&self, cipher: &[u8], params: &[u8], boots: i64, time: i64) -> Result<Vec<u8>, TransportError> {
        let Some((protocol, key)) = &self.privacy else {
            return Err(TransportError::Security("no privacy key".into()));
        };
        if params.len() != 8 {
            return Err(TransportError::Security(format!(
                "privacy parameters must be 8 bytes, found {}",
                params.len()
            )));
        }
        let cipher_error = |e: &dyn fmt::Debug| TransportError::Security(format!("decryption failed: {:?}", e));
        let mut buf = cipher.to_vec();
        match protocol {
            PrivProtocol::Des => {
                if buf.len() % 8 != 0 {
                    return Err(TransportError::Security(format!(
                        "DES ciphertext length {} is not a multiple of 8",
                        buf.len()
                    )));
                }
                let iv: Vec<u8> = key[8..16].iter().zip(params).map(|(a, b)| a ^ b).collect();
                cbc::Decryptor::<des::Des>::new_from_slices(&key[..8], &iv)
                    .map_err(|e| cipher_error(&e))?
                    .decrypt_padded_mut::<NoPadding>(&mut buf)
                    .map_err(|e| cipher_error(&e))?;
            }
            _ => {
                let iv = aes_iv(boots, time, params);
                match key.len() {
                    16 => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, &iv).map(|c| c.decrypt(&mut buf)),
                    24 => cfb_mode::Decryptor::<Aes192>::new_from_slices(key, &iv).map(|c| c.decrypt(&mut buf)),
                    _ => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, &iv).map(|c| c.decrypt(&mut buf)),
                }
                .map_err(|e| cipher_error(&e))?;
            }
        }
        Ok(buf)
    }
}

fn aes_iv(boots: i64, time: i64, salt: &[u8]) -> Vec<u8> {
    let mut iv = (boots as u32).to_be_bytes().to_vec();
    iv.extend((time as u32).to_be_bytes());
    iv.extend_from_slice(salt);
    iv
}

/// Report PDUs an agent answers with instead of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    UnsupportedSecurityLevel,
    NotInTimeWindow,
    UnknownUserName,
    UnknownEngineId,
    WrongDigest,
    DecryptionError,
    Other,
}

impl Report {
    fn from_oid(oid: &str) -> Self {
        match oid.trim_start_matches('.') {
            "1.3.6.1.6.3.15.1.1.1.0" => Report::UnsupportedSecurityLevel,
            "1.3.6.1.6.3.15.1.1.2.0" => Report::NotInTimeWindow,
            "1.3.6.1.6.3.15.1.1.3.0" => Report::UnknownUserName,
            "1.3.6.1.6.3.15.1.1.4.0" => Report::UnknownEngineId,
            "1.3.6.1.6.3.15.1.1.5.0" => Report::WrongDigest,
            "1.3.6.1.6.3.15.1.1.6.0" => Report::DecryptionError,
            _ => Report::Other,
        }
    }

    pub fn oid(self) -> &'static str {
        match self {
            Report::UnsupportedSecurityLevel => "1.3.6.1.6.3.15.1.1.1.0",
            Report::NotInTimeWindow => "1.3.6.1.6.3.15.1.1.2.0",
            Report::UnknownUserName => "1.3.6.1.6.3.15.1.1.3.0",
            Report::UnknownEngineId => "1.3.6.1.6.3.15.1.1.4.0",
            Report::WrongDigest => "1.3.6.1.6.3.15.1.1.5.0",
            Report::DecryptionError => "1.3.6.1.6.3.15.1.1.6.0",
            Report::Other => "",
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Report::UnsupportedSecurityLevel => "unsupported security level",
            Report::NotInTimeWindow => "not in time window",
            Report::UnknownUserName => "unknown user name",
            Report::UnknownEngineId => "unknown engine id",
            Report::WrongDigest => "wrong digest",
            Report::DecryptionError => "decryption error",
            Report::Other => "unexpected report",
        };
        f.write_str(name)
    }
}

/// What came back for a request.
#[derive(Debug)]
pub enum Reply {
    Pdu(Pdu),
    Report(Report),
}

struct Engine {
    id: Vec<u8>,
    boots: i64,
    time: i64,
    synced: Instant,
    keys: Arc<UserKeys>,
}

impl Engine {
    fn clock(&self) -> (i64, i64) {
        let elapsed = self.synced.elapsed().as_secs() as i64;
        (self.boots, (self.time + elapsed).min(ENGINE_TIME_MAX))
    }
}

/// Client side of USM for one session: the user's credentials plus what was
/// learned about the agent's engine.
pub struct Usm {
    user: Vec<u8>,
    level: SecurityLevel,
    auth: Option<(AuthProtocol, String)>,
    privacy: Option<(PrivProtocol, String)>,
    context_name: Vec<u8>,
    engine: Mutex<Option<Engine>>,
    salt: AtomicU64,
}

impl Usm {
    pub fn new(
        user: &str,
        level: SecurityLevel,
        auth: Option<(AuthProtocol, String)>,
        privacy: Option<(PrivProtocol, String)>,
        context_name: &str,
    ) -> Self {
        Self {
            user: user.as_bytes().to_vec(),
            level,
            auth,
            privacy,
            context_name: context_name.as_bytes().to_vec(),
            engine: Mutex::new(None),
            salt: AtomicU64::new(rand::random()),
        }
    }

    fn flags(&self) -> u8 {
        match self.level {
            SecurityLevel::NoAuthNoPriv => 0,
            SecurityLevel::AuthNoPriv => FLAG_AUTH,
            SecurityLevel::AuthPriv => FLAG_AUTH | FLAG_PRIV,
        }
    }

    pub fn engine_id(&self) -> Option<Vec<u8>> {
        self.engine.lock().as_ref().map(|e| e.id.clone())
    }

    /// An unauthenticated empty GET that makes the agent report its engine.
    pub fn discovery_request(&self, msg_id: i32) -> Result<Vec<u8>, TransportError> {
        let msg = V3Message {
            msg_id,
            max_size: MAX_MESSAGE_SIZE,
            flags: FLAG_REPORTABLE,
            usm: UsmParams::default(),
            data: ScopedData::Plain(ScopedPdu {
                context_engine_id: Vec::new(),
                context_name: Vec::new(),
                pdu: Pdu::request(PduType::Get, msg_id, &[]),
            }),
        };
        Ok(msg.encode()?.0)
    }

    /// Adopt the engine an agent announced. Keys are derived again only when
    /// the engine id changes.
    fn learn(&self, params: &UsmParams) -> Result<(), TransportError> {
        if params.engine_id.is_empty() {
            return Err(TransportError::Security("agent reported an empty engine id".into()));
        }
        let known = {
            let engine = self.engine.lock();
            engine
                .as_ref()
                .filter(|e| e.id == params.engine_id)
                .map(|e| e.keys.clone())
        };
        let keys = match known {
            Some(keys) => keys,
            None => Arc::new(UserKeys::derive(
                self.auth.as_ref().map(|(p, s)| (*p, s.as_str())),
                self.privacy.as_ref().map(|(p, s)| (*p, s.as_str())),
                &params.engine_id,
            )?),
        };
        *self.engine.lock() = Some(Engine {
            id: params.engine_id.clone(),
            boots: params.engine_boots,
            time: params.engine_time,
            synced: Instant::now(),
            keys,
        });
        Ok(())
    }

    /// Move the engine clock forward from an authenticated message.
    fn resync(&self, params: &UsmParams) {
        let mut engine = self.engine.lock();
        if let Some(engine) = engine.as_mut() {
            let (boots, time) = engine.clock();
            if params.engine_boots > boots || (params.engine_boots == boots && params.engine_time > time) {
                engine.boots = params.engine_boots;
                engine.time = params.engine_time;
                engine.synced = Instant::now();
            }
        }
    }

    /// Build the wire form of `pdu` for the discovered engine.
    pub fn seal(&self, pdu: Pdu) -> Result<Vec<u8>, TransportError> {
        let (id, boots, time, keys) = {
            let engine = self.engine.lock();
            let engine = engine
                .as_ref()
                .ok_or_else(|| TransportError::Security("engine not discovered".into()))?;
            let (boots, time) = engine.clock();
            (engine.id.clone(), boots, time, engine.keys.clone())
        };

        let flags = self.flags();
        let msg_id = pdu.request_id;
        let scoped = ScopedPdu {
            context_engine_id: id.clone(),
            context_name: self.context_name.clone(),
            pdu,
        };
        let (data, priv_params) = if flags & FLAG_PRIV != 0 {
            let salt = self.salt.fetch_add(1, Ordering::Relaxed);
            let (cipher, params) = keys.encrypt(&scoped.encode()?, boots, time, salt)?;
            (ScopedData::Encrypted(cipher), params)
        } else {
            (ScopedData::Plain(scoped), Vec::new())
        };
        let auth_params = match (&self.auth, flags & FLAG_AUTH != 0) {
            (Some((protocol, _)), true) => vec![0u8; protocol.mac_len()],
            _ => Vec::new(),
        };

        let msg = V3Message {
            msg_id,
            max_size: MAX_MESSAGE_SIZE,
            flags: flags | FLAG_REPORTABLE,
            usm: UsmParams {
                engine_id: id,
                engine_boots: boots,
                engine_time: time,
                user_name: self.user.clone(),
                auth_params,
                priv_params,
            },
            data,
        };
        let (mut packet, at) = msg.encode()?;
        if flags & FLAG_AUTH != 0 {
            keys.sign(&mut packet, at)?;
        }
        Ok(packet)
    }

    /// Authenticate and decrypt a received message. Engine reports update
    /// the engine state before they are returned.
    pub fn open(&self, raw: &[u8]) -> Result<Reply, TransportError> {
        let (msg, at) = V3Message::decode(raw)?;
        let authenticated = msg.flags & FLAG_AUTH != 0;

        let keys = self.engine.lock().as_ref().map(|e| e.keys.clone());
        if authenticated {
            let keys = keys
                .as_ref()
                .ok_or_else(|| TransportError::Security("authenticated message before discovery".into()))?;
            keys.verify(raw, at, &msg.usm.auth_params)?;
        }

        let scoped = match &msg.data {
            ScopedData::Plain(scoped) => scoped.clone(),
            ScopedData::Encrypted(cipher) => {
                if msg.flags & FLAG_PRIV == 0 || !authenticated {
                    return Err(TransportError::Security("encrypted data without privacy flags".into()));
                }
                let keys = keys.ok_or_else(|| TransportError::Security("encrypted message before discovery".into()))?;
                let plain = keys.decrypt(cipher, &msg.usm.priv_params, msg.usm.engine_boots, msg.usm.engine_time)?;
                ScopedPdu::decode(&plain)?
            }
        };

        if scoped.pdu.kind != PduType::Report {
            if authenticated {
                self.resync(&msg.usm);
            } else if self.flags() & FLAG_AUTH != 0 {
                return Err(TransportError::Security("unauthenticated response".into()));
            }
            return Ok(Reply::Pdu(scoped.pdu));
        }

        let report = scoped
            .pdu
            .varbinds
            .first()
            .map(|vb| Report::from_oid(&vb.oid))
            .unwrap_or(Report::Other);
        match report {
            Report::UnknownEngineId => self.learn(&msg.usm)?,
            // A forged time report could wind the clock, so only trust it
            // when it is authenticated or nothing is.
            Report::NotInTimeWindow if authenticated || self.flags() & FLAG_AUTH == 0 => {
                let mut engine = self.engine.lock();
                if let Some(engine) = engine.as_mut() {
                    engine.boots = msg.usm.engine_boots;
                    engine.time = msg.usm.engine_time;
                    engine.synced = Instant::now();
                }
            }
            _ => {}
        }
        Ok(Reply::Report(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hex(s: &str) -> Vec<u8> {
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    const ENGINE: &str = "000000000000000000000002";

    #[test]
    fn md5_key_localization() {
        let ku = password_to_key(AuthProtocol::Md5, b"maplesyrup").unwrap();
        assert_eq!(ku, hex("9faf3283884e92834ebc9847d8edd963"));
        let kul = localize(AuthProtocol::Md5, &ku, &hex(ENGINE));
        assert_eq!(kul, hex("526f5eed9fcce26f8964c2930787d82b"));
    }

    #[test]
    fn sha1_key_localization() {
        let ku = password_to_key(AuthProtocol::Sha, b"maplesyrup").unwrap();
        assert_eq!(ku, hex("9fb5cc0381497b3793528939ff788d5d79145211"));
        let kul = localize(AuthProtocol::Sha, &ku, &hex(ENGINE));
        assert_eq!(kul, hex("6695febc9288e36282235fc7151f128497b38f3f"));
    }

    #[test]
    fn privacy_keys_are_extended() {
        let engine = hex(ENGINE);
        let base = localize(AuthProtocol::Sha, &password_to_key(AuthProtocol::Sha, b"maplesyrup").unwrap(), &engine);

        let blumenthal = privacy_key(AuthProtocol::Sha, PrivProtocol::Aes256, b"maplesyrup", &engine).unwrap();
        assert_eq!(blumenthal.len(), 32);
        assert_eq!(&blumenthal[..20], base.as_slice());
        assert_eq!(&blumenthal[20..], &digest(AuthProtocol::Sha, &[base.as_slice()])[..12]);

        let reeder = privacy_key(AuthProtocol::Sha, PrivProtocol::Aes256C, b"maplesyrup", &engine).unwrap();
        assert_eq!(&reeder[..20], base.as_slice());
        assert_ne!(reeder, blumenthal);

        let des = privacy_key(AuthProtocol::Sha, PrivProtocol::Des, b"maplesyrup", &engine).unwrap();
        assert_eq!(des, base[..16].to_vec());
    }

    #[test]
    fn empty_password_is_refused() {
        assert!(matches!(
            password_to_key(AuthProtocol::Md5, b""),
            Err(TransportError::Security(_))
        ));
    }

    fn keys(auth: AuthProtocol, privacy: PrivProtocol) -> UserKeys {
        UserKeys::derive(Some((auth, "authpass1")), Some((privacy, "privpass1")), &hex(ENGINE)).unwrap()
    }

    #[test]
    fn ciphers_round_trip() {
        let plain = b"scoped pdu bytes, not a multiple of the block size".to_vec();
        for privacy in [
            PrivProtocol::Des,
            PrivProtocol::Aes,
            PrivProtocol::Aes192,
            PrivProtocol::Aes256,
            PrivProtocol::Aes192C,
            PrivProtocol::Aes256C,
        ] {
            let keys = keys(AuthProtocol::Sha256, privacy);
            let (cipher, params) = keys.encrypt(&plain, 4, 5000, 99).unwrap();
            assert_ne!(&cipher[..plain.len()], plain.as_slice(), "{:?}", privacy);
            let opened = keys.decrypt(&cipher, &params, 4, 5000).unwrap();
            assert_eq!(&opened[..plain.len()], plain.as_slice(), "{:?}", privacy);
        }

        let keys = keys(AuthProtocol::Md5, PrivProtocol::Aes);
        let (cipher, params) = keys.encrypt(&plain, 4, 5000, 1).unwrap();
        let skewed = keys.decrypt(&cipher, &params, 4, 5001).unwrap();
        assert_ne!(skewed, plain);
        assert!(keys.decrypt(&cipher, &params[..4], 4, 5000).is_err());
    }

    #[test]
    fn sign_and_verify() {
        for auth in [
            AuthProtocol::Md5,
            AuthProtocol::Sha,
            AuthProtocol::Sha224,
            AuthProtocol::Sha256,
            AuthProtocol::Sha384,
            AuthProtocol::Sha512,
        ] {
            let keys = UserKeys::derive(Some((auth, "authpass1")), None, &hex(ENGINE)).unwrap();
            let mut packet = vec![0x30; 10];
            packet.extend(vec![0u8; auth.mac_len()]);
            packet.extend(b"payload");
            keys.sign(&mut packet, 10).unwrap();
            let tag = packet[10..10 + auth.mac_len()].to_vec();
            assert!(tag.iter().any(|b| *b != 0));
            keys.verify(&packet, 10, &tag).unwrap();

            let mut tampered = packet.clone();
            *tampered.last_mut().unwrap() ^= 1;
            assert!(keys.verify(&tampered, 10, &tag).is_err(), "{:?}", auth);
        }
    }

    #[test]
    fn privacy_without_auth_is_refused() {
        assert!(UserKeys::derive(None, Some((PrivProtocol::Aes, "privpass1")), b"e").is_err());
    }
}
