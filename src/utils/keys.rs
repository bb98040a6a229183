//! # Key Material
//!
//! Owns the listener's secrets: the RSA key pair for the legacy protocol and
//! the named shared secrets for the token protocol.
//!
//! Key material is assembled once at startup and wrapped in an `Arc`; nothing
//! mutates it afterwards, so handlers read it without locking. Rotating keys
//! means building a new listener.
//!
//! ## On-disk layout
//! The RSA directory holds two files, compatible with existing Votifier
//! installations:
//! - `public.key`: base64 of the DER `SubjectPublicKeyInfo`
//! - `private.key`: base64 of the DER PKCS#8 private key
//!
//! PEM-encoded files are accepted on load as well.

use crate::config::{KeyConfig, DEFAULT_TOKEN_ID};
use crate::error::{constants, CryptoError, ProtocolError, Result};
use crate::utils::crypto;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::distr::{Alphanumeric, SampleString};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

/// File name of the encoded public key
pub const PUBLIC_KEY_FILE: &str = "public.key";

/// File name of the encoded private key
pub const PRIVATE_KEY_FILE: &str = "private.key";

/// Length of generated token secrets
pub const TOKEN_LEN: usize = 26;

/// Generate a random token secret suitable for handing to a server list.
pub fn generate_token() -> String {
    Alphanumeric
        .sample_string(&mut rand::rng(), TOKEN_LEN)
        .to_lowercase()
}

/// RSA key pair used by the legacy block protocol.
#[derive(Clone)]
pub struct RsaKeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("bits", &(self.block_size() * 8))
            .finish_non_exhaustive()
    }
}

impl RsaKeyPair {
    pub fn new(public: RsaPublicKey, private: RsaPrivateKey) -> Self {
        Self { public, private }
    }

    /// Generate a fresh pair with a `bits`-bit modulus
    pub fn generate(bits: usize) -> Result<Self> {
        let (public, private) = crypto::generate_key_pair(bits)?;
        Ok(Self { public, private })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Bytes per encrypted block
    pub fn block_size(&self) -> usize {
        self.public.size()
    }

    /// Public key in the form server lists ask for (base64 DER, one line)
    pub fn public_key_base64(&self) -> Result<String> {
        let der = self
            .public
            .to_public_key_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// PEM encodings of (public, private)
    pub fn to_pem(&self) -> Result<(String, Zeroizing<String>)> {
        let public = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let private = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok((public, private))
    }

    pub fn from_pem(public_pem: &str, private_pem: &str) -> Result<Self> {
        let public = RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::checked(public, private)
    }

    /// Load `public.key` and `private.key` from `dir`
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()))]
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let public_text = fs::read_to_string(dir.join(PUBLIC_KEY_FILE))?;
        let private_text = Zeroizing::new(fs::read_to_string(dir.join(PRIVATE_KEY_FILE))?);

        if public_text.trim_start().starts_with("-----BEGIN") {
            return Self::from_pem(&public_text, &private_text);
        }

        let public_der = decode_key_text(&public_text)?;
        let private_der = Zeroizing::new(decode_key_text(&private_text)?);

        let public = RsaPublicKey::from_public_key_der(&public_der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let private = RsaPrivateKey::from_pkcs8_der(&private_der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::checked(public, private)
    }

    /// Write `public.key` and `private.key` into `dir`, creating it if needed
    #[instrument(skip(self, dir), fields(dir = %dir.as_ref().display()))]
    pub fn save_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let private_der = self
            .private
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let private_text = Zeroizing::new(BASE64.encode(private_der.as_bytes()));

        fs::write(dir.join(PUBLIC_KEY_FILE), self.public_key_base64()?)?;
        let private_path = dir.join(PRIVATE_KEY_FILE);
        fs::write(&private_path, private_text.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&private_path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn checked(public: RsaPublicKey, private: RsaPrivateKey) -> Result<Self> {
        if RsaPublicKey::from(&private) != public {
            return Err(CryptoError::InvalidKey("public and private keys do not match".into()).into());
        }
        Ok(Self { public, private })
    }
}

fn decode_key_text(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")).into())
}

/// Shared secret for one V2 token identifier. Zeroed on drop.
#[derive(Clone)]
pub struct TokenSecret(Zeroizing<Vec<u8>>);

impl TokenSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(..)")
    }
}

/// Everything a listener needs to authenticate votes.
#[derive(Debug, Clone, Default)]
pub struct KeyMaterial {
    rsa: Option<RsaKeyPair>,
    tokens: HashMap<String, TokenSecret>,
}

impl KeyMaterial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the legacy-protocol key pair
    pub fn with_rsa(mut self, pair: RsaKeyPair) -> Self {
        self.rsa = Some(pair);
        self
    }

    /// Register a V2 shared secret under `id`
    pub fn with_token(mut self, id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.tokens.insert(id.into(), TokenSecret::new(secret));
        self
    }

    pub fn rsa(&self) -> Option<&RsaKeyPair> {
        self.rsa.as_ref()
    }

    pub fn token(&self, id: &str) -> Option<&TokenSecret> {
        self.tokens.get(id)
    }

    pub fn token_ids(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(String::as_str)
    }

    pub fn supports_v1(&self) -> bool {
        self.rsa.is_some()
    }

    pub fn supports_v2(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Pick the secret for a V2 message.
    ///
    /// An explicit identifier is authoritative. Without one, the payload's
    /// service name is tried, then the `default` token.
    pub fn resolve_token(&self, explicit: Option<&str>, service: &str) -> Option<&TokenSecret> {
        match explicit {
            Some(id) => self.tokens.get(id),
            None => self
                .tokens
                .get(service)
                .or_else(|| self.tokens.get(DEFAULT_TOKEN_ID)),
        }
    }

    /// Build key material from configuration, generating what is missing.
    ///
    /// When a default token is generated it is written into `config.tokens`
    /// so the host can persist it.
    pub fn load_or_generate(config: &mut KeyConfig, load_rsa: bool) -> Result<Self> {
        let mut material = Self::new();

        if load_rsa {
            material.rsa = Some(load_or_generate_rsa(config)?);
        }

        if config.tokens.is_empty() && config.generate_default_token {
            let token = generate_token();
            config
                .tokens
                .insert(DEFAULT_TOKEN_ID.to_string(), token.clone());
            info!(
                token = %token,
                "No tokens configured; generated a default token. Provide it to server lists using the V2 protocol."
            );
        }

        for (id, secret) in &config.tokens {
            if secret.is_empty() {
                return Err(ProtocolError::ConfigError(format!(
                    "{} ('{id}')",
                    constants::ERR_EMPTY_TOKEN
                )));
            }
            material = material.with_token(id.clone(), secret.as_bytes());
            info!(token_id = %id, "Token loaded");
        }

        Ok(material)
    }
}

fn load_or_generate_rsa(config: &KeyConfig) -> Result<RsaKeyPair> {
    let dir = &config.rsa_directory;
    let present = dir.join(PUBLIC_KEY_FILE).exists() && dir.join(PRIVATE_KEY_FILE).exists();

    if present {
        let pair = RsaKeyPair::load_dir(dir)?;
        info!(dir = %dir.display(), bits = pair.block_size() * 8, "Loaded RSA key pair");
        return Ok(pair);
    }

    if !config.generate_missing {
        return Err(ProtocolError::ConfigError(format!(
            "{}: {}",
            constants::ERR_KEYS_MISSING,
            dir.display()
        )));
    }

    warn!(dir = %dir.display(), bits = config.key_bits, "No RSA keys found; generating a new pair");
    let pair = RsaKeyPair::generate(config.key_bits)?;
    pair.save_dir(dir)?;
    Ok(pair)
}
