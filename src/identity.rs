//! Identity material - operational and custodial keys
//!
//! Locally an identity is two files under the wallet root:
//!   {wallet_root}/{wallet}/hotkeys/{hotkey}   operational key
//!   {wallet_root}/{wallet}/coldkeypub.txt     custodial public key
//!
//! On a node the same files live in one of two slots under the remote root:
//! `default` (used by the supervised job) and `fast` (disposable, used by
//! the registration tool).
//!
//! Staged material is always compared in canonical form: the `ss58Address`
//! field when the file is a JSON keyfile, the trimmed content otherwise.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::remote::{shell_path, RunOptions, Session};

/// An identity configured locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub wallet: String,
    pub hotkey: String,
    wallet_root: PathBuf,
}

/// Remote identity slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySlot {
    Default,
    Fast,
}

/// Canonical identifiers found on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFiles {
    pub operational_key: Option<String>,
    pub custodial_key: Option<String>,
}

impl Identity {
    pub fn new(wallet_root: &Path, wallet: impl Into<String>, hotkey: impl Into<String>) -> Self {
        Self {
            wallet: wallet.into(),
            hotkey: hotkey.into(),
            wallet_root: wallet_root.to_path_buf(),
        }
    }

    pub fn operational_key_path(&self) -> PathBuf {
        self.wallet_root
            .join(&self.wallet)
            .join("hotkeys")
            .join(&self.hotkey)
    }

    pub fn custodial_key_path(&self) -> PathBuf {
        self.wallet_root.join(&self.wallet).join("coldkeypub.txt")
    }

    /// Fails with `MissingIdentity` naming the first absent file
    pub fn verify_local(&self) -> Result<()> {
        for path in [self.operational_key_path(), self.custodial_key_path()] {
            if !path.is_file() {
                return Err(FleetError::MissingIdentity(path));
            }
        }
        Ok(())
    }

    /// Canonical operational address, used for ledger lookups
    pub fn address(&self) -> Result<String> {
        let path = self.operational_key_path();
        let content = std::fs::read_to_string(&path)
            .map_err(|_| FleetError::MissingIdentity(path.clone()))?;
        Ok(canonical(&content))
    }

    fn custodial_address(&self) -> Result<String> {
        let path = self.custodial_key_path();
        let content = std::fs::read_to_string(&path)
            .map_err(|_| FleetError::MissingIdentity(path.clone()))?;
        Ok(canonical(&content))
    }
}

impl IdentitySlot {
    pub fn name(&self) -> &'static str {
        match self {
            IdentitySlot::Default => "default",
            IdentitySlot::Fast => "fast",
        }
    }

    pub fn hotkeys_dir(&self, remote_root: &str) -> String {
        format!("{}/{}/hotkeys", remote_root, self.name())
    }

    pub fn operational_key_path(&self, remote_root: &str) -> String {
        format!("{}/{}", self.hotkeys_dir(remote_root), self.name())
    }

    pub fn custodial_key_path(&self, remote_root: &str) -> String {
        format!("{}/{}/coldkeypub.txt", remote_root, self.name())
    }
}

/// Canonical form of a key file
pub fn canonical(content: &str) -> String {
    #[derive(Deserialize)]
    struct KeyFile {
        #[serde(rename = "ss58Address")]
        ss58_address: String,
    }

    match serde_json::from_str::<KeyFile>(content.trim()) {
        Ok(key) => key.ss58_address,
        Err(_) => content.trim().to_string(),
    }
}

async fn read_remote(session: &dyn Session, path: &str) -> Result<Option<String>> {
    let result = session
        .run(&format!("cat {}", shell_path(path)), RunOptions::default().quiet().allow_failure())
        .await?;
    Ok(result.success().then(|| canonical(&result.stdout)))
}

/// Read whatever identity material a slot currently holds
pub async fn read_slot(
    session: &dyn Session,
    remote_root: &str,
    slot: IdentitySlot,
) -> Result<IdentityFiles> {
    Ok(IdentityFiles {
        operational_key: read_remote(session, &slot.operational_key_path(remote_root)).await?,
        custodial_key: read_remote(session, &slot.custodial_key_path(remote_root)).await?,
    })
}

/// Create the remote directory structure for a slot
pub async fn prepare_slot(session: &dyn Session, remote_root: &str, slot: IdentitySlot) -> Result<()> {
    session
        .run(
            &format!("mkdir -p {}", shell_path(&slot.hotkeys_dir(remote_root))),
            RunOptions::default(),
        )
        .await?;
    Ok(())
}

/// Replace the slot's files with the local material: remove, then upload
pub async fn write_slot(
    session: &dyn Session,
    identity: &Identity,
    remote_root: &str,
    slot: IdentitySlot,
) -> Result<()> {
    let pairs = [
        (identity.operational_key_path(), slot.operational_key_path(remote_root)),
        (identity.custodial_key_path(), slot.custodial_key_path(remote_root)),
    ];

    for (local, remote) in pairs {
        session
            .run(&format!("rm -f {}", shell_path(&remote)), RunOptions::default())
            .await?;
        session.put(&local, &remote).await?;
    }

    debug!(node = %session.node().name, slot = slot.name(), "Identity material written");
    Ok(())
}

/// Read the slot back and require a canonical match with the local identity
pub async fn verify_slot(
    session: &dyn Session,
    identity: &Identity,
    remote_root: &str,
    slot: IdentitySlot,
) -> Result<()> {
    let staged = read_slot(session, remote_root, slot).await?;
    let expected = [
        ("operational key", identity.address()?, staged.operational_key),
        ("custodial key", identity.custodial_address()?, staged.custodial_key),
    ];

    for (file, local, staged) in expected {
        if staged.as_deref() != Some(local.as_str()) {
            return Err(FleetError::IdentityMismatch {
                node: session.node().name.clone(),
                file: format!("{} ({})", file, slot.name()),
                local,
                staged: staged.unwrap_or_else(|| "<missing>".to_string()),
            });
        }
    }
    Ok(())
}

/// Prepare, write and verify in one go
pub async fn stage(
    session: &dyn Session,
    identity: &Identity,
    remote_root: &str,
    slot: IdentitySlot,
) -> Result<()> {
    identity.verify_local()?;
    prepare_slot(session, remote_root, slot).await?;
    write_slot(session, identity, remote_root, slot).await?;
    verify_slot(session, identity, remote_root, slot).await
}

#[cfg(test)]
pub(crate) fn write_local_identity(root: &Path, wallet: &str, hotkey: &str) -> Identity {
    let identity = Identity::new(root, wallet, hotkey);
    std::fs::create_dir_all(identity.operational_key_path().parent().unwrap()).unwrap();
    std::fs::write(
        identity.operational_key_path(),
        format!(r#"{{"accountId": "0x01", "ss58Address": "5Hot{}"}}"#, hotkey),
    )
    .unwrap();
    std::fs::write(
        identity.custodial_key_path(),
        format!(r#"{{"ss58Address": "5Cold{}"}}"#, wallet),
    )
    .unwrap();
    identity
}
