//! Device Registry
//!
//! Keeps the devices observed during discovery alongside the platform's
//! bonded devices and builds the view handed to the presentation layer.

use crate::domain::models::{BondState, Device};

#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    bonded: Vec<Device>,
    discovered: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery notification.
    ///
    /// A known address is updated in place and keeps its position. A
    /// notification without a name never erases a name seen earlier, and a
    /// named one renames every copy of the address, the bonded one included.
    /// Returns true when the collection changed.
    pub fn observe(&mut self, device: Device) -> bool {
        let mut changed = false;
        if device.has_name() {
            for bonded in self
                .bonded
                .iter_mut()
                .filter(|d| d.address == device.address && d.name != device.name)
            {
                bonded.name = device.name.clone();
                changed = true;
            }
        }

        match self
            .discovered
            .iter_mut()
            .find(|d| d.address == device.address)
        {
            Some(existing) => {
                if device.has_name() && existing.name != device.name {
                    existing.name = device.name;
                    changed = true;
                }
                if existing.bond_state != device.bond_state {
                    existing.bond_state = device.bond_state;
                    changed = true;
                }
                changed
            }
            None => {
                self.discovered.push(device);
                true
            }
        }
    }

    /// Apply a resolved name for an address seen before
    pub fn rename(&mut self, address: &str, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut changed = false;
        for device in self
            .bonded
            .iter_mut()
            .chain(self.discovered.iter_mut())
            .filter(|d| d.address == address)
        {
            if device.name.as_deref() != Some(name) {
                device.name = Some(name.to_string());
                changed = true;
            }
        }
        changed
    }

    /// Replace the snapshot of bonded devices
    pub fn set_bonded(&mut self, devices: Vec<Device>) {
        self.bonded = devices;
    }

    pub fn set_bond_state(&mut self, address: &str, state: BondState) {
        for device in self
            .bonded
            .iter_mut()
            .chain(self.discovered.iter_mut())
            .filter(|d| d.address == address)
        {
            device.bond_state = state;
        }
    }

    pub fn discovered(&self) -> &[Device] {
        &self.discovered
    }

    pub fn find(&self, address: &str) -> Option<&Device> {
        self.bonded
            .iter()
            .chain(self.discovered.iter())
            .find(|d| d.address == address)
    }

    /// Bonded devices followed by discovered ones, one entry per address.
    /// The bonded record wins when both lists know an address.
    pub fn merged(&self) -> Vec<Device> {
        let mut merged: Vec<Device> = Vec::with_capacity(self.bonded.len() + self.discovered.len());
        for device in self.bonded.iter().chain(self.discovered.iter()) {
            if !merged.iter().any(|d| d.address == device.address) {
                merged.push(device.clone());
            }
        }
        merged
    }
}

/// Build the presented list: optionally drop unnamed devices, then put named
/// devices first and the most recently observed first within each group.
pub fn present(devices: &[Device], hide_unnamed: bool) -> Vec<Device> {
    let mut indexed: Vec<(usize, &Device)> = devices
        .iter()
        .enumerate()
        .filter(|(_, d)| !hide_unnamed || d.has_name())
        .collect();

    indexed.sort_by(|(ia, a), (ib, b)| b.has_name().cmp(&a.has_name()).then(ib.cmp(ia)));

    indexed.into_iter().map(|(_, d)| d.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(address: &str, name: Option<&str>) -> Device {
        Device::new(address, name, BondState::None)
    }

    #[test]
    fn test_repeated_addresses_are_not_duplicated() {
        let mut registry = DeviceRegistry::new();
        registry.observe(found("AA:BB:CC:DD:EE:01", None));
        registry.observe(found("AA:BB:CC:DD:EE:02", Some("Other")));
        registry.observe(found("AA:BB:CC:DD:EE:01", Some("Car")));
        registry.observe(found("AA:BB:CC:DD:EE:01", Some("Car v2")));

        let discovered = registry.discovered();
        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[0].name.as_deref(), Some("Car v2"));
    }

    #[test]
    fn test_nameless_notification_keeps_known_name() {
        let mut registry = DeviceRegistry::new();
        registry.observe(found("AA:BB:CC:DD:EE:FF", Some("Car")));
        let changed = registry.observe(found("AA:BB:CC:DD:EE:FF", None));

        assert!(!changed);
        let shown = present(&registry.merged(), true);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].name.as_deref(), Some("Car"));
    }

    #[test]
    fn test_bonded_record_takes_precedence() {
        let mut registry = DeviceRegistry::new();
        registry.observe(found("AA:BB:CC:DD:EE:01", Some("Scanned")));
        registry.observe(found("AA:BB:CC:DD:EE:02", Some("Fresh")));
        registry.set_bonded(vec![Device::new(
            "AA:BB:CC:DD:EE:01",
            Some("Paired"),
            BondState::Bonded,
        )]);

        let merged = registry.merged();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name.as_deref(), Some("Paired"));
        assert!(merged[0].is_bonded());
        assert_eq!(merged[1].address, "AA:BB:CC:DD:EE:02");
    }

    #[test]
    fn test_named_first_then_most_recent() {
        let devices = vec![
            found("01", Some("Alpha")),
            found("02", None),
            found("03", Some("Beta")),
            found("04", Some("")),
        ];

        let shown: Vec<_> = present(&devices, false)
            .into_iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(shown, vec!["03", "01", "04", "02"]);

        let named: Vec<_> = present(&devices, true)
            .into_iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(named, vec!["03", "01"]);
    }

    #[test]
    fn test_toggling_filter_leaves_observed_set_alone() {
        let mut registry = DeviceRegistry::new();
        registry.observe(found("01", Some("Alpha")));
        registry.observe(found("02", None));
        registry.observe(found("03", Some("Beta")));
        let before = registry.merged();

        let unfiltered = present(&registry.merged(), false);
        let filtered = present(&registry.merged(), true);
        let unfiltered_again = present(&registry.merged(), false);

        assert_eq!(registry.merged(), before);
        assert_eq!(filtered.len(), 2);
        assert_eq!(unfiltered, unfiltered_again);
    }

    #[test]
    fn test_rename_updates_every_copy() {
        let mut registry = DeviceRegistry::new();
        registry.observe(found("01", None));
        registry.set_bonded(vec![Device::new("01", None, BondState::Bonded)]);

        assert!(registry.rename("01", "Car"));
        assert!(!registry.rename("01", ""));
        assert_eq!(registry.find("01").and_then(|d| d.name.as_deref()), Some("Car"));
        assert_eq!(registry.discovered()[0].name.as_deref(), Some("Car"));
    }

    #[test]
    fn test_discovered_name_reaches_bonded_copy() {
        let mut registry = DeviceRegistry::new();
        registry.set_bonded(vec![Device::new(
            "AA:BB:CC:DD:EE:FF",
            Some("Old"),
            BondState::Bonded,
        )]);

        assert!(registry.observe(found("AA:BB:CC:DD:EE:FF", Some("Car"))));
        let shown = present(&registry.merged(), true);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].name.as_deref(), Some("Car"));
        assert!(shown[0].is_bonded());

        // A nameless sighting leaves the bonded name alone
        assert!(!registry.observe(found("AA:BB:CC:DD:EE:FF", None)));
        assert_eq!(
            registry.find("AA:BB:CC:DD:EE:FF").and_then(|d| d.name.as_deref()),
            Some("Car")
        );
    }
}
