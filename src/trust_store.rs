//! Installing the root into the operating system's trust store
use crate::ca::SigningIdentity;
use crate::config::write_private_file;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// A place where trusted roots are registered
#[async_trait]
pub trait TrustStore: Send + Sync {
  /// Whether a root with the identity's common name is already trusted
  async fn is_installed(&self, identity: &SigningIdentity) -> Result<bool>;
  /// Register the identity's root as a trusted authority
  async fn add_as_trusted_root(&self, identity: &SigningIdentity) -> Result<()>;
}

/// Install the root unless `required` is false or it is already trusted.
///
/// Returns whether an installation happened. Existing entries are never
/// touched.
pub async fn install_root_if_needed(
  store: &dyn TrustStore,
  identity: &SigningIdentity,
  required: bool,
) -> Result<bool> {
  if !required {
    return Ok(false);
  }
  if store.is_installed(identity).await? {
    tracing::debug!("root {} already trusted", identity.common_name());
    return Ok(false);
  }
  tracing::info!("installing root {} as a trusted authority", identity.common_name());
  store.add_as_trusted_root(identity).await?;
  Ok(true)
}

struct CommandOutcome {
  success: bool,
  stderr: String,
}

async fn run_command<I, S>(operation: &str, program: &str, args: I) -> Result<CommandOutcome>
where
  I: IntoIterator<Item = S>,
  S: AsRef<OsStr>,
{
  let output = tokio::process::Command::new(program)
    .args(args)
    .output()
    .await
    .map_err(|e| match e.kind() {
      std::io::ErrorKind::NotFound => {
        Error::trust_store(format!("{}: command '{}' not found", operation, program))
      }
      _ => Error::trust_store(format!("{}: {}", operation, e)),
    })?;
  Ok(CommandOutcome {
    success: output.status.success(),
    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
  })
}

/// The trust store of the platform the process runs on
#[derive(Debug, Clone)]
pub struct PlatformTrustStore {
  /// Directory holding anchor files on Linux
  pub anchor_dir: PathBuf,
  /// Directory where the root is staged for the platform tools
  pub staging_dir: PathBuf,
}

impl PlatformTrustStore {
  /// Use `staging_dir` (normally the configuration directory) for staged files
  pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
    Self {
      anchor_dir: PathBuf::from("/usr/local/share/ca-certificates"),
      staging_dir: staging_dir.into(),
    }
  }

  fn anchor_path(&self, identity: &SigningIdentity) -> PathBuf {
    self.anchor_dir.join(format!("{}.crt", identity.common_name()))
  }

  /// Write the root where the platform tools can read it, owner-only
  #[cfg_attr(target_os = "linux", allow(dead_code))]
  async fn stage(&self, identity: &SigningIdentity) -> Result<StagedRoot> {
    let path = self
      .staging_dir
      .join(format!("{}.staged.crt", identity.common_name()));
    write_private_file(&path, identity.root_pem().as_bytes())
      .await
      .map_err(|e| Error::trust_store(format!("unable to stage root: {}", e)))?;
    Ok(StagedRoot { path: Some(path) })
  }
}

/// A staged copy of the root, removed again when dropped
#[cfg_attr(target_os = "linux", allow(dead_code))]
struct StagedRoot {
  path: Option<PathBuf>,
}

#[cfg_attr(target_os = "linux", allow(dead_code))]
impl StagedRoot {
  fn path(&self) -> &Path {
    self.path.as_deref().unwrap_or_else(|| Path::new(""))
  }

  /// Leave the file in place for a manual install
  fn keep(mut self) -> PathBuf {
    self.path.take().unwrap_or_default()
  }
}

impl Drop for StagedRoot {
  fn drop(&mut self) {
    if let Some(path) = self.path.take() {
      if let Err(e) = std::fs::remove_file(&path) {
        tracing::debug!("unable to remove staged root {}: {}", path.display(), e);
      }
    }
  }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl TrustStore for PlatformTrustStore {
  async fn is_installed(&self, identity: &SigningIdentity) -> Result<bool> {
    match tokio::fs::read_to_string(self.anchor_path(identity)).await {
      Ok(pem) => Ok(pem.trim() == identity.root_pem().trim()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(Error::trust_store(format!("unable to read anchor: {}", e))),
    }
  }

  async fn add_as_trusted_root(&self, identity: &SigningIdentity) -> Result<()> {
    tokio::fs::create_dir_all(&self.anchor_dir)
      .await
      .map_err(|e| Error::trust_store(format!("unable to create anchor dir: {}", e)))?;
    tokio::fs::write(self.anchor_path(identity), identity.root_pem())
      .await
      .map_err(|e| Error::trust_store(format!("unable to write anchor: {}", e)))?;
    let outcome = run_command("install root", "update-ca-certificates", Vec::<&str>::new()).await?;
    if !outcome.success {
      return Err(Error::trust_store(format!("install root: {}", outcome.stderr)));
    }
    Ok(())
  }
}

#[cfg(target_os = "macos")]
#[async_trait]
impl TrustStore for PlatformTrustStore {
  async fn is_installed(&self, identity: &SigningIdentity) -> Result<bool> {
    let outcome = run_command(
      "find root",
      "security",
      ["find-certificate", "-c", identity.common_name()],
    )
    .await?;
    Ok(outcome.success)
  }

  async fn add_as_trusted_root(&self, identity: &SigningIdentity) -> Result<()> {
    let staged = self.stage(identity).await?;
    let outcome = run_command(
      "install root",
      "security",
      [
        OsStr::new("add-trusted-cert"),
        OsStr::new("-r"),
        OsStr::new("trustRoot"),
        staged.path().as_os_str(),
      ],
    )
    .await?;
    if !outcome.success {
      return Err(Error::trust_store(format!("install root: {}", outcome.stderr)));
    }
    Ok(())
  }
}

#[cfg(target_os = "windows")]
#[async_trait]
impl TrustStore for PlatformTrustStore {
  async fn is_installed(&self, identity: &SigningIdentity) -> Result<bool> {
    let outcome = run_command(
      "find root",
      "certutil",
      ["-verifystore", "Root", identity.common_name()],
    )
    .await?;
    Ok(outcome.success)
  }

  async fn add_as_trusted_root(&self, identity: &SigningIdentity) -> Result<()> {
    let staged = self.stage(identity).await?;
    let outcome = run_command(
      "install root",
      "certutil",
      [
        OsStr::new("-addstore"),
        OsStr::new("Root"),
        staged.path().as_os_str(),
      ],
    )
    .await?;
    if !outcome.success {
      return Err(Error::trust_store(format!("install root: {}", outcome.stderr)));
    }
    Ok(())
  }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
#[async_trait]
impl TrustStore for PlatformTrustStore {
  async fn is_installed(&self, _identity: &SigningIdentity) -> Result<bool> {
    Err(Error::trust_store("trust store is not supported on this platform"))
  }

  async fn add_as_trusted_root(&self, identity: &SigningIdentity) -> Result<()> {
    let staged = self.stage(identity).await?.keep();
    Err(Error::trust_store(format!(
      "trust store is not supported on this platform, install {} manually",
      staged.display()
    )))
  }
}
