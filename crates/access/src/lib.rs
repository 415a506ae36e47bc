//! Access control for shares: three tiers with distinct key-management
//! protocols, per-member commitments, and the token codec.
//!
//! The single caller-visible failure is [`AccessError::AccessDenied`]:
//! wrong passphrase, missing or revoked commitment, expired, revoked and
//! non-existent shares are indistinguishable to the presenter. The log
//! records the specific cause.

pub mod tokens;

use std::collections::BTreeMap;

use common::{
    now_epoch, AccessTier, Classify, Commitment, CommitmentId, ErrorClass, Folder, Share,
    ShareId, ShareKind,
};
use crypto::{
    derive_member_wrapping_key, derive_passphrase_key, generate_salt, passphrase_verifier,
    sha256_hex, unwrap_key, verify_passphrase, wrap_key, MasterKey,
};
use store::Store;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use tokens::{
    encode_compact, encode_json, encode_legacy, encode_uri, parse, ParsedToken, TokenDescriptor,
    TokenError, TokenIndexRef, UriToken,
};

#[derive(Error, Debug)]
pub enum AccessError {
    /// The one answer every failed access attempt gets.
    #[error("access denied")]
    AccessDenied,

    #[error("share owner required for this operation")]
    NotOwner,

    #[error("folder has no key material; index it before publishing")]
    FolderNotReady,

    #[error("share tier does not support this operation")]
    WrongTier,

    #[error("store: {0}")]
    Store(#[from] store::StoreError),

    #[error("crypto: {0}")]
    Crypto(#[from] crypto::CryptoError),
}

impl Classify for AccessError {
    fn class(&self) -> ErrorClass {
        match self {
            AccessError::AccessDenied => ErrorClass::Auth,
            AccessError::NotOwner => ErrorClass::Auth,
            AccessError::FolderNotReady | AccessError::WrongTier => ErrorClass::Validation,
            AccessError::Store(e) => e.class(),
            AccessError::Crypto(e) => e.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AccessError>;

/// Credentials presented with an access attempt.
pub enum AccessRequest<'a> {
    /// Key travels with the token.
    Open { key: &'a MasterKey },
    Member {
        user_id: &'a str,
        public_key: &'a [u8],
    },
    Passphrase(&'a str),
}

#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    pub scrypt_n: u32,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
    pub pbkdf2_iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            scrypt_n: crypto::DEFAULT_SCRYPT_N,
            scrypt_r: crypto::DEFAULT_SCRYPT_R,
            scrypt_p: crypto::DEFAULT_SCRYPT_P,
            pbkdf2_iterations: crypto::DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

pub struct AccessControl {
    store: Store,
    kdf: KdfParams,
}

impl AccessControl {
    pub fn new(store: Store, kdf: KdfParams) -> Self {
        Self { store, kdf }
    }

    fn folder_master_key(folder: &Folder) -> Result<MasterKey> {
        let encoded = folder
            .content_key
            .as_deref()
            .ok_or(AccessError::FolderNotReady)?;
        Ok(MasterKey::from_base64(encoded)?)
    }

    fn expiry(expiry_days: Option<u32>) -> Option<i64> {
        expiry_days.map(|days| now_epoch() + days as i64 * 86_400)
    }

    /// Open share: the master key rides in the token; anyone holding the
    /// token decrypts directly.
    #[instrument(skip(self, folder))]
    pub async fn create_open_share(
        &self,
        folder: &Folder,
        owner_id: &str,
        kind: ShareKind,
        expiry_days: Option<u32>,
    ) -> Result<(Share, MasterKey)> {
        let master = Self::folder_master_key(folder)?;
        let share = Share {
            share_id: ShareId::generate(),
            folder_id: folder.folder_id,
            folder_version: folder.version,
            kind,
            tier: AccessTier::Open,
            owner_id: owner_id.to_string(),
            master_key: Some(master.to_base64()),
            passphrase_hash: None,
            passphrase_salt: None,
            key_salt: None,
            wrapped_keys: BTreeMap::new(),
            allowed_users: Vec::new(),
            denied_users: Vec::new(),
            index_refs: Vec::new(),
            expires_at: Self::expiry(expiry_days),
            revoked: false,
            created_at: now_epoch(),
        };
        self.store.insert_share(&share).await?;
        info!(share_id = %share.share_id, "created open share");
        Ok((share, master))
    }

    /// Member share: the master key is wrapped once per authorised user;
    /// a commitment row proves each grant. The owner always keeps a
    /// self-addressed wrapped copy so the share stays recoverable.
    #[instrument(skip(self, folder, members))]
    pub async fn create_member_share(
        &self,
        folder: &Folder,
        owner_id: &str,
        owner_public_key: &[u8],
        members: &[(String, Vec<u8>)],
        kind: ShareKind,
        expiry_days: Option<u32>,
    ) -> Result<Share> {
        let master = Self::folder_master_key(folder)?;

        let owner_wrapping = derive_member_wrapping_key(owner_id, owner_public_key)?;
        let mut wrapped_keys = BTreeMap::new();
        wrapped_keys.insert(owner_id.to_string(), wrap_key(&master, &owner_wrapping)?);

        let mut share = Share {
            share_id: ShareId::generate(),
            folder_id: folder.folder_id,
            folder_version: folder.version,
            kind,
            tier: AccessTier::Member,
            owner_id: owner_id.to_string(),
            master_key: None,
            passphrase_hash: None,
            passphrase_salt: None,
            key_salt: None,
            wrapped_keys,
            allowed_users: members.iter().map(|(id, _)| id.clone()).collect(),
            denied_users: Vec::new(),
            index_refs: Vec::new(),
            expires_at: Self::expiry(expiry_days),
            revoked: false,
            created_at: now_epoch(),
        };
        self.store.insert_share(&share).await?;

        for (user_id, public_key) in members {
            self.grant(&mut share, user_id, public_key, &master).await?;
        }
        info!(share_id = %share.share_id, members = members.len(), "created member share");
        Ok(share)
    }

    /// Passphrase share: the master key is wrapped under a scrypt-derived
    /// key; a separate PBKDF2 digest (different salt) exists only to
    /// answer the wrong-passphrase probe.
    #[instrument(skip(self, folder, passphrase))]
    pub async fn create_passphrase_share(
        &self,
        folder: &Folder,
        owner_id: &str,
        passphrase: &str,
        kind: ShareKind,
        expiry_days: Option<u32>,
    ) -> Result<Share> {
        let master = Self::folder_master_key(folder)?;

        let key_salt = generate_salt();
        let wrapping = derive_passphrase_key(
            passphrase,
            &key_salt,
            self.kdf.scrypt_n,
            self.kdf.scrypt_r,
            self.kdf.scrypt_p,
        )?;
        let wrapped_master = wrap_key(&master, &wrapping)?;

        let verifier_salt = generate_salt();
        let verifier = passphrase_verifier(passphrase, &verifier_salt, self.kdf.pbkdf2_iterations);

        let share = Share {
            share_id: ShareId::generate(),
            folder_id: folder.folder_id,
            folder_version: folder.version,
            kind,
            tier: AccessTier::Passphrase,
            owner_id: owner_id.to_string(),
            master_key: Some(wrapped_master),
            passphrase_hash: Some(hex::encode(verifier)),
            passphrase_salt: Some(hex::encode(verifier_salt)),
            key_salt: Some(hex::encode(key_salt)),
            wrapped_keys: BTreeMap::new(),
            allowed_users: Vec::new(),
            denied_users: Vec::new(),
            index_refs: Vec::new(),
            expires_at: Self::expiry(expiry_days),
            revoked: false,
            created_at: now_epoch(),
        };
        self.store.insert_share(&share).await?;
        info!(share_id = %share.share_id, "created passphrase share");
        Ok(share)
    }

    async fn grant(
        &self,
        share: &mut Share,
        user_id: &str,
        public_key: &[u8],
        master: &MasterKey,
    ) -> Result<()> {
        let wrapping = derive_member_wrapping_key(user_id, public_key)?;
        let wrapped = wrap_key(master, &wrapping)?;

        let commitment_hash = sha256_hex(
            format!("{}:{}:{}", share.share_id, user_id, hex::encode(public_key)).as_bytes(),
        );
        let commitment = Commitment {
            commitment_id: CommitmentId::generate(),
            share_id: share.share_id.clone(),
            user_id: user_id.to_string(),
            commitment_hash,
            wrapped_key: wrapped.clone(),
            permissions: r#"{"read":true,"write":false}"#.to_string(),
            granted_at: now_epoch(),
            revoked: false,
            revoked_at: None,
        };
        self.store.upsert_commitment(&commitment).await?;

        share.wrapped_keys.insert(user_id.to_string(), wrapped);
        self.store
            .update_share_wrapped_keys(&share.share_id, &share.wrapped_keys)
            .await?;
        debug!(share_id = %share.share_id, user_id, "granted member access");
        Ok(())
    }

    /// Grant a member on an existing member share. Owner-only.
    pub async fn add_member(
        &self,
        share_id: &ShareId,
        granter_id: &str,
        user_id: &str,
        public_key: &[u8],
    ) -> Result<()> {
        let mut share = self
            .store
            .share(share_id)
            .await?
            .ok_or(AccessError::AccessDenied)?;
        if share.tier != AccessTier::Member {
            return Err(AccessError::WrongTier);
        }
        if share.owner_id != granter_id {
            return Err(AccessError::NotOwner);
        }

        // The owner's own wrapped copy plus the folder row carry the key;
        // re-derive the master from the folder to wrap for the new member.
        let folder = self.store.folder(&share.folder_id).await?;
        let master = Self::folder_master_key(&folder)?;
        self.grant(&mut share, user_id, public_key, &master).await?;
        Ok(())
    }

    /// Revoke one member: their wrapped key entry goes away and their
    /// commitment is marked revoked. Everyone else keeps access.
    pub async fn remove_member(
        &self,
        share_id: &ShareId,
        revoker_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let mut share = self
            .store
            .share(share_id)
            .await?
            .ok_or(AccessError::AccessDenied)?;
        if share.owner_id != revoker_id {
            return Err(AccessError::NotOwner);
        }
        self.store.revoke_commitment(share_id, user_id).await?;
        if share.wrapped_keys.remove(user_id).is_some() {
            self.store
                .update_share_wrapped_keys(share_id, &share.wrapped_keys)
                .await?;
        }
        info!(share_id = %share_id, user_id, "member revoked");
        Ok(())
    }

    pub async fn revoke_share(&self, share_id: &ShareId, revoker_id: &str) -> Result<()> {
        let share = self
            .store
            .share(share_id)
            .await?
            .ok_or(AccessError::AccessDenied)?;
        if share.owner_id != revoker_id {
            return Err(AccessError::NotOwner);
        }
        self.store.revoke_share(share_id).await?;
        info!(share_id = %share_id, "share revoked");
        Ok(())
    }

    /// Verify an access attempt and return the segment decryption key.
    ///
    /// Every failure path collapses into `AccessDenied`; expiry is
    /// enforced here on every attempt.
    #[instrument(skip(self, request))]
    pub async fn verify_access(
        &self,
        share_id: &ShareId,
        request: AccessRequest<'_>,
    ) -> Result<MasterKey> {
        let share = match self.store.share(share_id).await? {
            Some(share) => share,
            None => {
                debug!(share_id = %share_id, "share does not exist");
                return Err(AccessError::AccessDenied);
            }
        };
        if share.revoked {
            debug!(share_id = %share_id, "share is revoked");
            return Err(AccessError::AccessDenied);
        }
        if let Some(expires_at) = share.expires_at {
            if now_epoch() >= expires_at {
                debug!(share_id = %share_id, "share is expired");
                return Err(AccessError::AccessDenied);
            }
        }

        match (share.tier, request) {
            (AccessTier::Open, AccessRequest::Open { key }) => {
                // The token carried the key; confirm it matches the record
                // so a forged token cannot silently decrypt garbage.
                match share.master_key.as_deref() {
                    Some(stored) if stored == key.to_base64() => Ok(key.clone()),
                    _ => {
                        debug!(share_id = %share_id, "open token key mismatch");
                        Err(AccessError::AccessDenied)
                    }
                }
            }
            (AccessTier::Member, AccessRequest::Member { user_id, public_key }) => {
                self.verify_member(&share, user_id, public_key).await
            }
            (AccessTier::Passphrase, AccessRequest::Passphrase(passphrase)) => {
                self.verify_passphrase_tier(&share, passphrase)
            }
            _ => {
                debug!(share_id = %share_id, "credentials do not match share tier");
                Err(AccessError::AccessDenied)
            }
        }
    }

    async fn verify_member(
        &self,
        share: &Share,
        user_id: &str,
        public_key: &[u8],
    ) -> Result<MasterKey> {
        if share.denied_users.iter().any(|denied| denied == user_id) {
            debug!(user_id, "user is on the deny list");
            return Err(AccessError::AccessDenied);
        }

        let wrapped = match self.store.live_commitment(&share.share_id, user_id).await? {
            Some(commitment) => {
                let expected = sha256_hex(
                    format!("{}:{}:{}", share.share_id, user_id, hex::encode(public_key))
                        .as_bytes(),
                );
                if commitment.commitment_hash != expected {
                    debug!(user_id, "commitment hash mismatch");
                    return Err(AccessError::AccessDenied);
                }
                commitment.wrapped_key
            }
            None if share.owner_id == user_id => match share.wrapped_keys.get(user_id) {
                Some(wrapped) => wrapped.clone(),
                None => {
                    debug!(user_id, "owner wrapped key missing");
                    return Err(AccessError::AccessDenied);
                }
            },
            None => {
                debug!(user_id, "no live commitment");
                return Err(AccessError::AccessDenied);
            }
        };

        let wrapping = derive_member_wrapping_key(user_id, public_key)?;
        unwrap_key(&wrapped, &wrapping).map_err(|e| {
            // Wrong key material and wrong passphrase look identical to
            // callers; only the log knows.
            debug!(user_id, error = %e, "member unwrap failed");
            AccessError::AccessDenied
        })
    }

    fn verify_passphrase_tier(&self, share: &Share, passphrase: &str) -> Result<MasterKey> {
        let (verifier_hex, verifier_salt_hex, key_salt_hex, wrapped) = match (
            share.passphrase_hash.as_deref(),
            share.passphrase_salt.as_deref(),
            share.key_salt.as_deref(),
            share.master_key.as_deref(),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => {
                debug!(share_id = %share.share_id, "passphrase share missing material");
                return Err(AccessError::AccessDenied);
            }
        };

        let verifier_salt = hex::decode(verifier_salt_hex).unwrap_or_default();
        let expected = hex::decode(verifier_hex).unwrap_or_default();
        if !verify_passphrase(
            passphrase,
            &verifier_salt,
            self.kdf.pbkdf2_iterations,
            &expected,
        ) {
            debug!(share_id = %share.share_id, "wrong passphrase");
            return Err(AccessError::AccessDenied);
        }

        let key_salt = hex::decode(key_salt_hex).unwrap_or_default();
        let wrapping = derive_passphrase_key(
            passphrase,
            &key_salt,
            self.kdf.scrypt_n,
            self.kdf.scrypt_r,
            self.kdf.scrypt_p,
        )?;
        unwrap_key(wrapped, &wrapping).map_err(|e| {
            debug!(share_id = %share.share_id, error = %e, "passphrase unwrap failed");
            AccessError::AccessDenied
        })
    }

    /// Token in display form for a freshly published share.
    pub fn issue_token(share: &Share, master: Option<&MasterKey>) -> String {
        encode_uri(&share.share_id, share.tier, master)
    }

    /// Full JSON-framed token carrying the index references.
    pub fn issue_json_token(share: &Share) -> String {
        let index = match share.index_refs.len() {
            0 => None,
            1 => Some(TokenIndexRef::Single {
                message_id: share.index_refs[0].message_id.clone(),
                group: share.index_refs[0].group.clone(),
            }),
            n => Some(TokenIndexRef::Multi {
                count: n as u32,
                segments: share
                    .index_refs
                    .iter()
                    .map(|r| (r.index, r.message_id.clone(), r.group.clone()))
                    .collect(),
            }),
        };
        let descriptor = TokenDescriptor::new(
            share.share_id.clone(),
            share.tier,
            share.folder_id.to_string()[..16].to_string(),
            share.folder_version,
            share.created_at,
            index,
        );
        encode_json(&descriptor)
    }
}
