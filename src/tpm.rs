//! TPM 2.0 backend for the hardware-isolated tier.
//!
//! The vault key is drawn from the TPM's RNG and sealed with an RSA-2048
//! child key created under an owner-hierarchy primary. Only the sealed blob
//! (child key public/private areas plus the RSA-encrypted vault key) is kept,
//! in a sled tree. The primary is re-derived from the same template on every
//! use, so the child blobs only load on the TPM that created them.
//!
//! A blob the TPM rejects as bound to a key or seed that no longer exists
//! (TPM cleared, owner seed changed) is reported as a permanently
//! invalidated key. Transient TPM failures stay plain TPM errors.

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::convert::TryFrom;
use std::str::FromStr;
use tracing::{debug, error, info, instrument, trace, warn};
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::{KeyHandle as TpmKeyHandle, ObjectHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::{
    Data, Private, Public, PublicBuilder, PublicKeyRsa, PublicRsaParametersBuilder,
    RsaDecryptionScheme, RsaExponent, RsaScheme, SensitiveData, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TabrmdConfig;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::TSS2_RC;
use tss_esapi::{Context, TctiNameConf};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::crypt::{GcmCipher, VaultKey};
use crate::keystore::{
    AES_256_KEY_LEN, Direction, HardwareKeyStore, KeyHandle, KeyPolicy, KeyStoreError,
    ProviderCipher, SecurityTier,
};

const RSA_KEY_BITS: u16 = 2048;
const KEY_TREE: &str = "tpm_keys";

/// Format-one TPM response codes after which the sealed objects will never
/// open again: TPM_RC_VALUE, TPM_RC_AUTH_FAIL, TPM_RC_KEY, TPM_RC_INTEGRITY,
/// TPM_RC_BAD_AUTH and TPM_RC_BINDING.
const PERMANENT_RESPONSE_CODES: [TSS2_RC; 6] = [0x084, 0x08E, 0x09C, 0x09F, 0x0A2, 0x0A5];
const RC_LAYER_MASK: TSS2_RC = 0x00FF_0000;
const RC_FMT1: TSS2_RC = 0x080;
/// Format bit plus error number, without the parameter/handle/session position
const RC_FMT1_ERROR_MASK: TSS2_RC = 0x0BF;

/// TCTI from `TPM2TOOLS_TCTI`, falling back to the tabrmd D-Bus broker.
pub fn default_tcti() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or(TctiNameConf::Tabrmd(TabrmdConfig::default()))
}

/// What gets persisted per alias.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct SealedKey {
    policy: KeyPolicy,
    generation: u64,
    public_key: Vec<u8>,
    private_key_blob: Vec<u8>,
    encrypted_key: Vec<u8>,
}

impl SealedKey {
    fn handle(&self) -> KeyHandle {
        KeyHandle::new(&self.policy.alias, self.policy.tier, self.generation)
    }

    fn encode(&self) -> Result<Vec<u8>, KeyStoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KeyStoreError::Backend(format!("failed to encode sealed key: {e}")))
    }

    fn decode(bytes: &[u8]) -> Result<Self, KeyStoreError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(sealed, _)| sealed)
            .map_err(|e| KeyStoreError::Backend(format!("failed to decode sealed key: {e}")))
    }
}

/// A TPM context with the sealing primary loaded.
///
/// Transient objects are flushed on drop.
struct Sealer {
    ctx: Context,
    primary: TpmKeyHandle,
    child: Option<TpmKeyHandle>,
}

impl Sealer {
    #[instrument(level = "debug", skip_all)]
    fn open(tcti: TctiNameConf) -> Result<Self, tss_esapi::Error> {
        let mut ctx = Context::new(tcti)?;

        let object_attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_restricted(true)
            .with_decrypt(true)
            .build()?;

        let rsa_params = PublicRsaParametersBuilder::new_restricted_decryption_key(
            SymmetricDefinitionObject::AES_128_CFB,
            RsaKeyBits::try_from(RSA_KEY_BITS)?,
            RsaExponent::default(),
        )
        .build()?;

        let template = PublicBuilder::new()
            .with_object_attributes(object_attributes)
            .with_rsa_parameters(rsa_params)
            .with_public_algorithm(PublicAlgorithm::Rsa)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_rsa_unique_identifier(PublicKeyRsa::default())
            .build()?;
        trace!(?template, "Creating RSA primary key");

        let primary = ctx.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
        })?;

        Ok(Self {
            ctx,
            primary: primary.key_handle,
            child: None,
        })
    }

    fn random_key(&mut self) -> Result<VaultKey, KeyStoreError> {
        let random = self.ctx.get_random(AES_256_KEY_LEN)?;
        VaultKey::from_slice(random.value())
    }

    /// Creates and loads an unrestricted RSA decryption key under the primary.
    fn generate_child(&mut self) -> Result<(Public, Private), tss_esapi::Error> {
        let rsa_params = PublicRsaParametersBuilder::new()
            .with_scheme(RsaScheme::Null)
            .with_key_bits(RsaKeyBits::try_from(RSA_KEY_BITS)?)
            .with_exponent(RsaExponent::default())
            .with_symmetric(SymmetricDefinitionObject::Null)
            .with_is_signing_key(false)
            .with_is_decryption_key(true)
            .with_restricted(false)
            .build()?;

        let object_attrs = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .build()?;

        let template = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::Rsa)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attrs)
            .with_rsa_parameters(rsa_params)
            .with_rsa_unique_identifier(PublicKeyRsa::default())
            .build()?;

        let primary = self.primary;
        let created = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create(
                primary,
                template,
                None,
                Some(SensitiveData::default()),
                None,
                None,
            )
        })?;
        debug!(
            private_len = created.out_private.value().len(),
            "Sealing key created in TPM"
        );

        self.load_child(created.out_public.clone(), created.out_private.clone())?;
        Ok((created.out_public, created.out_private))
    }

    fn load_child(&mut self, public: Public, private: Private) -> Result<(), tss_esapi::Error> {
        let primary = self.primary;
        let child = self
            .ctx
            .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))?;
        self.child = Some(child);
        Ok(())
    }

    fn child(&self) -> Result<TpmKeyHandle, tss_esapi::Error> {
        self.child.ok_or(tss_esapi::Error::WrapperError(
            tss_esapi::WrapperErrorKind::ParamsMissing,
        ))
    }

    fn seal(&mut self, key: &VaultKey) -> Result<Vec<u8>, tss_esapi::Error> {
        let child = self.child()?;
        let message = PublicKeyRsa::try_from(key.key().expose_secret().to_vec())?;
        let sealed = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.rsa_encrypt(child, message, RsaDecryptionScheme::RsaEs, Data::default())
        })?;
        Ok(sealed.value().to_vec())
    }

    fn unseal(&mut self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, tss_esapi::Error> {
        let child = self.child()?;
        let ciphertext = PublicKeyRsa::try_from(sealed.to_vec())?;
        let plain = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.rsa_decrypt(child, ciphertext, RsaDecryptionScheme::RsaEs, Data::default())
        })?;
        Ok(Zeroizing::new(plain.value().to_vec()))
    }
}

impl Drop for Sealer {
    fn drop(&mut self) {
        for handle in self.child.take().into_iter().chain([self.primary]) {
            if let Err(e) = self.ctx.flush_context(ObjectHandle::from(handle)) {
                debug!(error = %e, "Failed to flush transient TPM object");
            }
        }
    }
}

fn open_sealed(
    sealer: &mut Sealer,
    sealed: &SealedKey,
) -> Result<Zeroizing<Vec<u8>>, tss_esapi::Error> {
    let public = Public::unmarshall(&sealed.public_key)?;
    let private = Private::try_from(sealed.private_key_blob.as_slice()).map_err(|_| {
        tss_esapi::Error::WrapperError(tss_esapi::WrapperErrorKind::InvalidParam)
    })?;
    sealer.load_child(public, private)?;
    sealer.unseal(&sealed.encrypted_key)
}

/// True for response codes raised by the TPM itself that mean the blob is
/// bound to a key or seed that no longer exists. Warnings such as
/// TPM_RC_RETRY or TPM_RC_OBJECT_MEMORY, and anything from the TSS or the
/// resource manager layers, are not.
fn is_permanent_response(rc: TSS2_RC) -> bool {
    rc & RC_LAYER_MASK == 0
        && rc & RC_FMT1 != 0
        && PERMANENT_RESPONSE_CODES.contains(&(rc & RC_FMT1_ERROR_MASK))
}

fn is_permanent(err: &tss_esapi::Error) -> bool {
    match err {
        tss_esapi::Error::TssError(code) => is_permanent_response(TSS2_RC::from(*code)),
        // the stored blob no longer parses
        _ => true,
    }
}

/// Key store for [`SecurityTier::HardwareIsolated`] keys sealed by a TPM.
pub struct TpmKeyStore {
    tcti: TctiNameConf,
    db: Db,
    keys: Tree,
}

impl TpmKeyStore {
    /// Uses the `tpm_keys` tree of `db` for sealed blobs.
    pub fn new(tcti: TctiNameConf, db: &Db) -> Result<Self, KeyStoreError> {
        Ok(Self {
            tcti,
            db: db.clone(),
            keys: db.open_tree(KEY_TREE)?,
        })
    }

    /// Takes the TCTI from the config when set, [`default_tcti`] otherwise.
    pub fn from_config(config: &VaultConfig, db: &Db) -> Result<Self, KeyStoreError> {
        let tcti = match &config.tcti {
            Some(tcti) => TctiNameConf::from_str(tcti)?,
            None => default_tcti(),
        };
        Self::new(tcti, db)
    }

    fn load(&self, alias: &str) -> Result<Option<SealedKey>, KeyStoreError> {
        match self.keys.get(alias)? {
            Some(bytes) => SealedKey::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn unseal(&self, sealed: &SealedKey) -> Result<VaultKey, KeyStoreError> {
        let mut sealer = Sealer::open(self.tcti.clone())?;

        match open_sealed(&mut sealer, sealed) {
            Ok(raw) => VaultKey::from_slice(&raw),
            Err(e) if is_permanent(&e) => {
                warn!(error = %e, alias = %sealed.policy.alias, "Sealed vault key no longer opens");
                Err(KeyStoreError::KeyPermanentlyInvalidated)
            }
            Err(e) => {
                error!(error = %e, alias = %sealed.policy.alias, "TPM failed to unseal vault key");
                Err(KeyStoreError::Tpm(e))
            }
        }
    }
}

impl HardwareKeyStore for TpmKeyStore {
    #[instrument(level = "debug", skip(self, policy), fields(alias = %policy.alias))]
    fn create_key(&self, policy: &KeyPolicy) -> Result<KeyHandle, KeyStoreError> {
        if policy.tier != SecurityTier::HardwareIsolated {
            return Err(KeyStoreError::TierUnavailable(policy.tier));
        }
        policy.validate()?;

        let mut sealer = Sealer::open(self.tcti.clone()).inspect_err(|e| {
            error!(error = %e, "Failed to open TPM");
        })?;
        let key = sealer.random_key()?;
        let (public, private) = sealer.generate_child()?;
        let encrypted_key = sealer.seal(&key)?;

        let sealed = SealedKey {
            policy: policy.clone(),
            generation: self.db.generate_id()?,
            public_key: public.marshall()?,
            private_key_blob: private.value().to_vec(),
            encrypted_key,
        };
        self.keys.insert(policy.alias.as_str(), sealed.encode()?)?;
        self.keys.flush()?;

        info!(generation = sealed.generation, "Sealed vault key in TPM");
        Ok(sealed.handle())
    }

    fn get_key(&self, alias: &str) -> Option<KeyHandle> {
        match self.load(alias) {
            Ok(sealed) => sealed.map(|s| s.handle()),
            Err(e) => {
                error!(error = %e, alias, "Failed to read sealed key");
                None
            }
        }
    }

    fn delete_key(&self, alias: &str) -> Result<(), KeyStoreError> {
        let removed = self.keys.remove(alias)?.is_some();
        self.keys.flush()?;
        debug!(alias, removed, "Deleted sealed key");
        Ok(())
    }

    fn init_cipher(
        &self,
        key: &KeyHandle,
        direction: Direction,
        iv: Option<&[u8]>,
    ) -> Result<Box<dyn ProviderCipher>, KeyStoreError> {
        let sealed = self
            .load(key.alias())?
            .filter(|sealed| sealed.generation == key.generation())
            .ok_or_else(|| KeyStoreError::NotFound(key.alias().to_string()))?;

        let vault_key = self.unseal(&sealed)?;
        let cipher = GcmCipher::init(
            vault_key,
            direction,
            iv,
            sealed.policy.authorization_required,
        )?;
        Ok(Box::new(cipher))
    }
}
