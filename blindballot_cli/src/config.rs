use blindballot::{AuditSigner, AuthorityConfig, Error, KeyVault, SealingKey};
use std::env::var;
use std::path::Path;

const DEFAULT_ELECTION_ID: &str = "PLEBISCITO_2026";
const DEFAULT_PUBLIC_EXPONENT_HEX: &str = "10001";
const DEFAULT_KEY_BITS: usize = 2048;
const DEVICE_KEY_ID: &str = "e2e-device";

pub struct Config {
    pub authority: AuthorityConfig,
    pub election_id: String,
    pub vault_pin: Option<String>,
    pub vault_file: Option<String>,
}

/// The audit key and evidence key of the voting device
pub struct DeviceKeys {
    pub signer: AuditSigner,
    pub evidence_key: SealingKey,
    pub vault: Option<KeyVault>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let authority = match var("BLINDBALLOT_RSA_MODULUS_HEX") {
            Ok(n) => {
                let e = var("BLINDBALLOT_RSA_PUBLIC_EXPONENT_HEX")
                    .unwrap_or_else(|_| DEFAULT_PUBLIC_EXPONENT_HEX.to_owned());
                let d = var("BLINDBALLOT_RSA_PRIVATE_EXPONENT_HEX").map_err(|_| {
                    Error::MalformedInput(
                        "BLINDBALLOT_RSA_PRIVATE_EXPONENT_HEX must be set with the modulus".to_owned(),
                    )
                })?;
                AuthorityConfig::from_hex(&n, &e, &d)?
            }
            Err(_e) => {
                let bits = match var("BLINDBALLOT_RSA_BITS") {
                    Ok(val) => val.parse().map_err(|_| {
                        Error::MalformedInput(format!("invalid BLINDBALLOT_RSA_BITS: {}", val))
                    })?,
                    Err(_e) => DEFAULT_KEY_BITS,
                };
                log::info!("no authority key configured, generating a {}-bit key", bits);
                AuthorityConfig::generate(bits)?
            }
        };

        let election_id = var("BLINDBALLOT_ELECTION_ID").unwrap_or_else(|_| DEFAULT_ELECTION_ID.to_owned());

        Ok(Config {
            authority,
            election_id,
            vault_pin: var("BLINDBALLOT_VAULT_PIN").ok(),
            vault_file: var("BLINDBALLOT_VAULT_FILE").ok().map(|f| crate::expand(&f)),
        })
    }

    /// Open the device vault when a PIN is configured, creating it if the file does not exist.
    ///
    /// Without a PIN the device runs on throwaway keys.
    pub fn device_keys(&self) -> Result<DeviceKeys, Error> {
        let pin = match &self.vault_pin {
            Some(pin) => pin,
            None => {
                log::info!("BLINDBALLOT_VAULT_PIN not set, using ephemeral device keys");
                return Ok(DeviceKeys {
                    signer: AuditSigner::generate(),
                    evidence_key: SealingKey::generate(),
                    vault: None,
                });
            }
        };

        let existing = match &self.vault_file {
            Some(filename) if Path::new(filename).exists() => {
                let bytes = std::fs::read(filename)
                    .map_err(|e| Error::Store(format!("unable to read {}: {}", filename, e)))?;
                Some(serde_json::from_slice::<KeyVault>(&bytes)?)
            }
            _ => None,
        };

        let mut vault = match existing {
            Some(mut vault) => {
                vault.unlock(pin)?;
                vault
            }
            None => KeyVault::create(pin)?,
        };
        if !vault.has_keys() {
            vault.generate_key(DEVICE_KEY_ID)?;
        }

        Ok(DeviceKeys {
            signer: vault.signer(DEVICE_KEY_ID)?,
            evidence_key: vault.evidence_key()?,
            vault: Some(vault),
        })
    }
}
