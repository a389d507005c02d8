//! Device routing: maps a dialed extension to a persona profile.

use serde::{Deserialize, Serialize};

/// Identifier of the built-in fallback profile.
pub const DEFAULT_DEVICE_ID: &str = "default";

/// A routing entry: who answers when a given extension is dialed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Dialed extension (or logical name); unique within the routing table.
    pub id: String,
    /// Name spoken in the greeting.
    pub name: String,
    /// TTS voice identifier.
    pub voice: String,
    /// Persona fragment prepended to every query.
    #[serde(default)]
    pub prompt: Option<String>,
}

impl DeviceProfile {
    /// Built-in profile used when the config does not provide a default.
    pub fn fallback() -> Self {
        Self {
            id: DEFAULT_DEVICE_ID.to_string(),
            name: "Assistant".to_string(),
            voice: "alloy".to_string(),
            prompt: None,
        }
    }
}

/// Which resolution rule selected the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    /// The dialed identifier matched a profile exactly.
    Exact,
    /// No identifier at all (trunk call); first configured profile.
    FirstConfigured,
    /// Nothing matched.
    Default,
}

/// Immutable routing table owned for the process lifetime.
#[derive(Debug, Clone)]
pub struct DeviceRouter {
    devices: Vec<DeviceProfile>,
    default: DeviceProfile,
}

impl DeviceRouter {
    /// Build a router. Later duplicates of an id are dropped so lookups stay
    /// unambiguous.
    pub fn new(devices: Vec<DeviceProfile>, default: Option<DeviceProfile>) -> Self {
        let mut unique: Vec<DeviceProfile> = Vec::with_capacity(devices.len());
        for device in devices {
            if unique.iter().any(|d| d.id == device.id) {
                tracing::warn!("Duplicate device id '{}' ignored", device.id);
                continue;
            }
            unique.push(device);
        }
        Self {
            devices: unique,
            default: default.unwrap_or_else(DeviceProfile::fallback),
        }
    }

    pub fn devices(&self) -> &[DeviceProfile] {
        &self.devices
    }

    pub fn default_profile(&self) -> &DeviceProfile {
        &self.default
    }

    pub fn is_default(&self, device: &DeviceProfile) -> bool {
        device.id == self.default.id
    }

    /// Resolve the profile for a dialed identifier. Never fails.
    pub fn resolve(&self, dialed: Option<&str>) -> (&DeviceProfile, RouteMatch) {
        match dialed {
            Some(id) => match self.devices.iter().find(|d| d.id == id) {
                Some(device) => (device, RouteMatch::Exact),
                None => (&self.default, RouteMatch::Default),
            },
            None => match self.devices.first() {
                Some(device) => (device, RouteMatch::FirstConfigured),
                None => (&self.default, RouteMatch::Default),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, name: &str) -> DeviceProfile {
        DeviceProfile {
            id: id.to_string(),
            name: name.to_string(),
            voice: "nova".to_string(),
            prompt: Some(format!("You are {}.", name)),
        }
    }

    fn router() -> DeviceRouter {
        DeviceRouter::new(
            vec![profile("9000", "Morpheus"), profile("9001", "Trinity")],
            None,
        )
    }

    #[test]
    fn test_exact_match() {
        let r = router();
        let (device, how) = r.resolve(Some("9001"));
        assert_eq!(device.name, "Trinity");
        assert_eq!(how, RouteMatch::Exact);
    }

    #[test]
    fn test_unknown_extension_gets_default() {
        let r = router();
        for dialed in ["1234", "", "90000", "default-ish"] {
            let (device, how) = r.resolve(Some(dialed));
            assert_eq!(device, r.default_profile(), "dialed {:?}", dialed);
            assert_eq!(how, RouteMatch::Default);
        }
    }

    #[test]
    fn test_trunk_call_gets_first_device() {
        let r = router();
        let (device, how) = r.resolve(None);
        assert_eq!(device.name, "Morpheus");
        assert_eq!(how, RouteMatch::FirstConfigured);
    }

    #[test]
    fn test_trunk_call_with_empty_table_gets_default() {
        let r = DeviceRouter::new(vec![], Some(profile("default", "Operator")));
        let (device, how) = r.resolve(None);
        assert_eq!(device.name, "Operator");
        assert_eq!(how, RouteMatch::Default);
        assert!(r.is_default(device));
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let r = DeviceRouter::new(
            vec![profile("9000", "First"), profile("9000", "Second")],
            None,
        );
        assert_eq!(r.devices().len(), 1);
        assert_eq!(r.resolve(Some("9000")).0.name, "First");
    }
}
