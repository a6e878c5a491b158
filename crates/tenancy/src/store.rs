use crate::Error;
use aes_siv::aead::generic_array::GenericArray;
use aes_siv::aead::{Aead, KeyInit};
use aes_siv::Aes256SivAead;
use anyhow::Context;
use edgegrid::Credentials;
use models::{Environment, TenantId};
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroize;

/// Bundle is one tenant's credential material for one environment.
/// Immutable once loaded; rotation replaces the whole bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub tenant: TenantId,
    pub environment: Environment,
    pub credentials: Arc<Credentials>,
}

/// CredentialStore loads the credential bundles available to this process.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Vec<Bundle>, Error>;
}

/// IniStore reads the INI-shaped credential file. Each section names a
/// tenant and carries `client_token`, `access_token`, `client_secret`, and
/// `host`, plus optional `account-switch-key`, `max-body`, and
/// `environment` keys.
pub struct IniStore {
    path: PathBuf,
}

impl IniStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialStore for IniStore {
    fn load(&self) -> Result<Vec<Bundle>, Error> {
        warn_on_broad_permissions(&self.path);

        let mut raw = config::Config::default();
        raw.merge(config::File::from(self.path.clone()).format(config::FileFormat::Ini))
            .map_err(|err| Error::Load(anyhow::Error::new(err).context("reading credential file")))?;

        let sections: HashMap<String, HashMap<String, String>> = raw
            .try_into()
            .map_err(|err| Error::Load(anyhow::Error::new(err).context("parsing credential file")))?;

        let mut bundles = Vec::with_capacity(sections.len());
        for (name, section) in sections {
            bundles.push(
                bundle_from_section(&name, &section)
                    .with_context(|| format!("credential section {name:?}"))
                    .map_err(Error::Load)?,
            );
        }

        // Deterministic ordering keeps logs and default contexts stable.
        bundles.sort_by(|a, b| a.tenant.cmp(&b.tenant));

        tracing::info!(
            path = %self.path.display(),
            tenants = bundles.len(),
            "loaded credential file"
        );
        Ok(bundles)
    }
}

fn bundle_from_section(
    name: &str,
    section: &HashMap<String, String>,
) -> Result<Bundle, anyhow::Error> {
    let tenant = TenantId::new(name)?;
    let required = |key: &str| -> Result<&str, anyhow::Error> {
        section
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("missing required key {key:?}"))
    };

    let mut credentials = Credentials::new(
        required("client_token")?,
        required("access_token")?,
        required("client_secret")?,
        required("host")?,
    );
    credentials.account_switch_key = section.get("account-switch-key").cloned();
    if let Some(max_body) = section.get("max-body") {
        credentials.max_body = max_body
            .parse()
            .with_context(|| format!("invalid max-body {max_body:?}"))?;
    }

    let environment = match section.get("environment").map(String::as_str) {
        None | Some("production") => Environment::Production,
        Some("staging") => Environment::Staging,
        Some(other) => anyhow::bail!("invalid environment {other:?}"),
    };

    Ok(Bundle {
        tenant,
        environment,
        credentials: Arc::new(credentials),
    })
}

// Credential files should be readable by their owner alone.
fn warn_on_broad_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", mode & 0o777),
                    "credential file is readable by group or world; \
                     restrict it to owner read/write"
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// MasterKey is the administrator-supplied key protecting the secure
/// store. Zeroed on drop.
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    // AES-256-SIV takes a 64-byte key; stretch whatever the administrator
    // supplied through SHA-512.
    fn cipher(&self) -> Aes256SivAead {
        let key = Sha512::digest(&self.0);
        Aes256SivAead::new_from_slice(key.as_slice())
            .expect("SHA-512 output is exactly the cipher key size")
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

const NONCE_LEN: usize = 16;

#[derive(serde::Serialize, serde::Deserialize)]
struct SealedBundle {
    tenant: TenantId,
    #[serde(default)]
    environment: Environment,
    nonce: String,
    ciphertext: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PlainBundle {
    client_token: String,
    access_token: String,
    client_secret: String,
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account_switch_key: Option<String>,
    #[serde(default = "default_max_body")]
    max_body: usize,
}

fn default_max_body() -> usize {
    edgegrid::DEFAULT_MAX_BODY
}

/// SecureStore keeps bundles encrypted at rest with AES-256-SIV under the
/// administrator's master key. A bundle that fails to decrypt disables its
/// tenant and leaves an audit record; it never takes the store down or
/// invalidates live sessions.
pub struct SecureStore {
    path: PathBuf,
    master: MasterKey,
}

impl SecureStore {
    pub fn new(path: impl Into<PathBuf>, master: MasterKey) -> Self {
        Self {
            path: path.into(),
            master,
        }
    }

    /// Encrypt and write `bundles`, replacing the store file.
    /// Used by provisioning tooling and tests.
    pub fn seal(&self, bundles: &[Bundle]) -> Result<(), Error> {
        let cipher = self.master.cipher();
        let mut sealed = Vec::with_capacity(bundles.len());

        for bundle in bundles {
            let plain = PlainBundle {
                client_token: bundle.credentials.client_token.clone(),
                access_token: bundle.credentials.access_token.clone(),
                client_secret: bundle.credentials.client_secret.clone(),
                host: bundle.credentials.host.clone(),
                account_switch_key: bundle.credentials.account_switch_key.clone(),
                max_body: bundle.credentials.max_body,
            };
            let mut plaintext = serde_json::to_vec(&plain)
                .map_err(|err| Error::Load(anyhow::Error::new(err)))?;

            let nonce: [u8; NONCE_LEN] = rand_nonce();
            let ciphertext = cipher
                .encrypt(GenericArray::from_slice(&nonce), plaintext.as_slice())
                .map_err(|_| Error::Decrypt {
                    tenant: bundle.tenant.clone(),
                })?;
            plaintext.zeroize();

            sealed.push(SealedBundle {
                tenant: bundle.tenant.clone(),
                environment: bundle.environment,
                nonce: base64::encode(nonce),
                ciphertext: base64::encode(ciphertext),
            });
        }

        let json = serde_json::to_vec_pretty(&sealed)
            .map_err(|err| Error::Load(anyhow::Error::new(err)))?;
        std::fs::write(&self.path, json)
            .map_err(|err| Error::Load(anyhow::Error::new(err).context("writing secure store")))?;
        Ok(())
    }

    fn open_bundle(&self, cipher: &Aes256SivAead, sealed: &SealedBundle) -> Option<Bundle> {
        let nonce = base64::decode(&sealed.nonce).ok()?;
        let ciphertext = base64::decode(&sealed.ciphertext).ok()?;
        if nonce.len() != NONCE_LEN {
            return None;
        }

        let plaintext = cipher
            .decrypt(GenericArray::from_slice(&nonce), ciphertext.as_slice())
            .ok()?;
        let plain: PlainBundle = serde_json::from_slice(&plaintext).ok()?;

        let mut credentials = Credentials::new(
            plain.client_token,
            plain.access_token,
            plain.client_secret,
            plain.host,
        );
        credentials.account_switch_key = plain.account_switch_key;
        credentials.max_body = plain.max_body;

        Some(Bundle {
            tenant: sealed.tenant.clone(),
            environment: sealed.environment,
            credentials: Arc::new(credentials),
        })
    }
}

impl CredentialStore for SecureStore {
    fn load(&self) -> Result<Vec<Bundle>, Error> {
        let raw = std::fs::read(&self.path)
            .map_err(|err| Error::Load(anyhow::Error::new(err).context("reading secure store")))?;
        let sealed: Vec<SealedBundle> = serde_json::from_slice(&raw)
            .map_err(|err| Error::Load(anyhow::Error::new(err).context("parsing secure store")))?;

        let cipher = self.master.cipher();
        let mut bundles = Vec::with_capacity(sealed.len());
        for entry in &sealed {
            match self.open_bundle(&cipher, entry) {
                Some(bundle) => bundles.push(bundle),
                None => {
                    tracing::error!(
                        target: "audit",
                        tenant = %entry.tenant,
                        "credential bundle failed to decrypt; tenant disabled"
                    );
                }
            }
        }

        bundles.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        Ok(bundles)
    }
}

fn rand_nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

#[cfg(test)]
mod test {
    use super::*;

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    fn write_credential_file(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::Builder::new().suffix(".edgerc").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn ini_store_loads_sections() {
        let file = write_credential_file(
            r#"
[acme]
client_token = ct-acme
access_token = at-acme
client_secret = cs-acme
host = acme.example.net

[globex]
client_token = ct-globex
access_token = at-globex
client_secret = cs-globex
host = globex.example.net
account-switch-key = 1-ABC
max-body = 65536
environment = staging
"#,
        );

        let bundles = IniStore::new(file.path()).load().unwrap();
        assert_eq!(bundles.len(), 2);

        let acme = &bundles[0];
        assert_eq!(acme.tenant, tenant("acme"));
        assert_eq!(acme.environment, Environment::Production);
        assert_eq!(acme.credentials.host, "acme.example.net");
        assert_eq!(acme.credentials.max_body, edgegrid::DEFAULT_MAX_BODY);
        assert_eq!(acme.credentials.account_switch_key, None);

        let globex = &bundles[1];
        assert_eq!(globex.environment, Environment::Staging);
        assert_eq!(globex.credentials.max_body, 65536);
        assert_eq!(globex.credentials.account_switch_key.as_deref(), Some("1-ABC"));
    }

    #[test]
    fn ini_store_requires_core_keys() {
        let file = write_credential_file(
            r#"
[incomplete]
client_token = ct
host = h.example
"#,
        );

        let err = IniStore::new(file.path()).load().unwrap_err();
        assert!(matches!(err, Error::Load(_)), "{err}");
    }

    #[test]
    fn secure_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.sealed.json");

        let bundle = Bundle {
            tenant: tenant("acme"),
            environment: Environment::Production,
            credentials: Arc::new({
                let mut c = Credentials::new("ct", "at", "confidential-signing-secret", "acme.example.net");
                c.account_switch_key = Some("1-ABC".to_string());
                c
            }),
        };

        let store = SecureStore::new(&path, MasterKey::new(*b"hunter2"));
        store.seal(std::slice::from_ref(&bundle)).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].tenant, tenant("acme"));
        assert_eq!(loaded[0].credentials.client_secret, "confidential-signing-secret");
        assert_eq!(loaded[0].credentials.account_switch_key.as_deref(), Some("1-ABC"));

        // The file on disk carries no plaintext secrets.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(
            !raw.contains("confidential-signing-secret"),
            "secret leaked to disk: {raw}"
        );
    }

    #[test]
    fn wrong_master_key_disables_the_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.sealed.json");

        let bundle = Bundle {
            tenant: tenant("acme"),
            environment: Environment::Production,
            credentials: Arc::new(Credentials::new("ct", "at", "cs", "acme.example.net")),
        };
        SecureStore::new(&path, MasterKey::new(*b"hunter2"))
            .seal(std::slice::from_ref(&bundle))
            .unwrap();

        let loaded = SecureStore::new(&path, MasterKey::new(*b"wrong-key"))
            .load()
            .unwrap();
        assert!(loaded.is_empty());
    }
}
