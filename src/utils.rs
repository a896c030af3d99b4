use anyhow::Result;
use log::{error, info};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tokio::fs;

static MAC_ADDRESS_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// Normalizes a hardware address so it can be used as a map key:
/// surrounding whitespace trimmed, upper-cased, `-` separators turned into `:`.
pub fn normalize_address(raw: &str) -> String {
    raw.trim().to_ascii_uppercase().replace('-', ":")
}

/// Extracts the last MAC address embedded in a platform device id
/// (e.g. `BluetoothLE#BluetoothLEaa:bb:cc:dd:ee:ff-11:22:33:44:55:66`).
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = MAC_ADDRESS_RE
        .get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()?;
    re.find_iter(device_id)
        .last()
        .map(|m| normalize_address(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_address_uppercases_and_unifies_separators() {
        assert_eq!(normalize_address(" aa-bb-cc-dd-ee-ff "), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_address("AA:BB"), "AA:BB");
    }

    #[test]
    fn extract_mac_address_takes_last_match() {
        let id = "BluetoothLE#BluetoothLE00:1a:7d:da:71:13-c4:7c:8d:6a:12:0f";
        assert_eq!(extract_mac_address(id).as_deref(), Some("C4:7C:8D:6A:12:0F"));
        assert_eq!(extract_mac_address("/org/bluez/hci0"), None);
    }

    #[tokio::test]
    async fn ensure_directory_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_directory_exists(&nested).await.unwrap();
        ensure_directory_exists(&nested).await.unwrap();
        assert!(nested.is_dir());
    }
}
