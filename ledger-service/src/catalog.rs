//! Static knowledge about installed devices: which classroom each belongs to,
//! and how each relay's consumption is measured.

use std::collections::BTreeMap;

use ledger_client::domain::{CalculationMethod, CostScope};

use crate::config::DeviceConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchProfile {
    /// Rated power of the load. `None` when nobody recorded it.
    pub power_w: Option<f64>,
    pub method: CalculationMethod,
}

impl Default for SwitchProfile {
    fn default() -> Self {
        Self {
            power_w: None,
            method: CalculationMethod::PowerIntegration,
        }
    }
}

pub trait DeviceCatalog: Send + Sync {
    /// Profile of a relay. Unknown relays get the default profile.
    fn switch_profile(&self, device_id: &str, switch_id: &str) -> SwitchProfile;

    fn classroom(&self, device_id: &str) -> Option<String>;

    fn devices_in_classroom(&self, classroom: &str) -> Vec<String>;

    /// Narrowest cost scope that can apply to the device.
    fn cost_scope(&self, device_id: &str) -> CostScope {
        match self.classroom(device_id) {
            Some(room) => CostScope::Classroom(room),
            None => CostScope::Global,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceEntry {
    classroom: Option<String>,
    switches: BTreeMap<String, SwitchProfile>,
}

/// Catalog built once from the `[[devices]]` tables of the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    devices: BTreeMap<String, DeviceEntry>,
}

impl StaticCatalog {
    pub fn from_config(devices: &[DeviceConfig]) -> Self {
        let devices = devices
            .iter()
            .map(|d| {
                let switches = d
                    .switches
                    .iter()
                    .map(|s| {
                        (
                            s.switch_id.clone(),
                            SwitchProfile {
                                power_w: s.power_w,
                                method: s.method,
                            },
                        )
                    })
                    .collect();
                (
                    d.device_id.clone(),
                    DeviceEntry {
                        classroom: d.classroom.clone(),
                        switches,
                    },
                )
            })
            .collect();
        Self { devices }
    }
}

impl DeviceCatalog for StaticCatalog {
    fn switch_profile(&self, device_id: &str, switch_id: &str) -> SwitchProfile {
        self.devices
            .get(device_id)
            .and_then(|d| d.switches.get(switch_id))
            .copied()
            .unwrap_or_default()
    }

    fn classroom(&self, device_id: &str) -> Option<String> {
        self.devices.get(device_id).and_then(|d| d.classroom.clone())
    }

    fn devices_in_classroom(&self, classroom: &str) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, d)| d.classroom.as_deref() == Some(classroom))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn catalog() -> StaticCatalog {
        let cfg = AppConfig::from_toml_str(
            r#"
            [[devices]]
            device_id = "esp-101"
            classroom = "room-101"
            [[devices.switches]]
            switch_id = "1"
            power_w = 60.0

            [[devices]]
            device_id = "esp-102"
            classroom = "room-101"

            [[devices]]
            device_id = "esp-lab"
            "#,
        )
        .unwrap();
        StaticCatalog::from_config(&cfg.devices)
    }

    #[test]
    fn known_and_unknown_switches() {
        let c = catalog();
        assert_eq!(c.switch_profile("esp-101", "1").power_w, Some(60.0));
        assert_eq!(c.switch_profile("esp-101", "9"), SwitchProfile::default());
        assert_eq!(c.switch_profile("nope", "1").power_w, None);
    }

    #[test]
    fn classroom_membership_and_scope() {
        let c = catalog();
        assert_eq!(c.devices_in_classroom("room-101"), vec!["esp-101", "esp-102"]);
        assert_eq!(c.cost_scope("esp-101"), CostScope::Classroom("room-101".to_string()));
        assert_eq!(c.cost_scope("esp-lab"), CostScope::Global);
    }
}
