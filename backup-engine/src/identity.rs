//! Stable per-installation identity.

use crate::marker::DeviceClass;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

const INSTALLATION_ID_FILE: &str = "installation-id";

/// Identity of the running installation, used to name its backup slot and to
/// rank backups it made above foreign ones.
pub trait InstallationIdentity: Send + Sync {
    /// Opaque identifier stable across relaunches. `None` means the identity
    /// is temporarily unavailable and the caller should retry later.
    fn installation_id(&self) -> Option<String>;

    fn device_name(&self) -> String;

    fn device_class(&self) -> DeviceClass;
}

/// Identity persisted as a UUID in the engine's data directory.
#[derive(Debug, Clone)]
pub struct LocalInstallation {
    id_file: PathBuf,
    device_name: String,
    device_class: DeviceClass,
}

impl LocalInstallation {
    pub fn new(data_dir: &Path, device_name: String, device_class: DeviceClass) -> Self {
        Self {
            id_file: data_dir.join(INSTALLATION_ID_FILE),
            device_name,
            device_class,
        }
    }

    fn load_or_create(&self) -> std::io::Result<String> {
        match fs::read_to_string(&self.id_file) {
            Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if let Some(parent) = self.id_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let id = uuid::Uuid::new_v4().to_string().to_uppercase();
        fs::write(&self.id_file, &id)?;
        info!(installation_id = %id, "Created installation identity");
        Ok(id)
    }
}

impl InstallationIdentity for LocalInstallation {
    fn installation_id(&self) -> Option<String> {
        match self.load_or_create() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(path = %self.id_file.display(), error = %e, "Installation identity unavailable");
                None
            }
        }
    }

    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn device_class(&self) -> DeviceClass {
        self.device_class
    }
}

/// Whether `id` can name a backup slot: exactly one plain path component.
pub fn is_valid_installation_id(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == id
    )
}

/// Device name reported by the operating system.
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_stable_across_instances() {
        let dir = TempDir::new().unwrap();
        let first = LocalInstallation::new(dir.path(), "a".into(), DeviceClass::Desktop);
        let id = first.installation_id().unwrap();

        let second = LocalInstallation::new(dir.path(), "a".into(), DeviceClass::Desktop);
        assert_eq!(second.installation_id().unwrap(), id);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_installation_id_must_be_single_component() {
        assert!(is_valid_installation_id("0F8E1C2A-6B7D-4E3F-9A1B-2C3D4E5F6A7B"));
        assert!(!is_valid_installation_id(""));
        assert!(!is_valid_installation_id(".."));
        assert!(!is_valid_installation_id("."));
        assert!(!is_valid_installation_id("../x"));
        assert!(!is_valid_installation_id("a/b"));
        assert!(!is_valid_installation_id("/abs"));
        assert!(!is_valid_installation_id("x/"));
    }

    #[test]
    fn test_identity_unavailable_when_unwritable() {
        let dir = TempDir::new().unwrap();
        // A regular file where the data directory should be
        let blocker = dir.path().join("data");
        fs::write(&blocker, b"x").unwrap();

        let identity = LocalInstallation::new(&blocker, "a".into(), DeviceClass::Phone);
        assert!(identity.installation_id().is_none());
    }
}
