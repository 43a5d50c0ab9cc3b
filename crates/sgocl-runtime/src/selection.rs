//! Platform and device selection shared by every backend.
//!
//! Applies `PLATFORM`, `DEVICE_TYPE`, `SELECT_SPECIFIC_DEVICE` and
//! `MAX_DEVICES` to an enumerated platform list and assigns context
//! indices: one context overall, or one per platform for `PLATFORM = "all"`.

use sgocl_common::{ConfigError, DeviceTypeFilter, OclConfig, OclError, PlatformSelector, Result};
use tracing::{debug, info};

/// Devices exposed by one platform, in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDevices {
    pub name: String,
    pub device_types: Vec<DeviceTypeFilter>,
}

/// A device that survived selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedDevice {
    /// Index into the platform list.
    pub platform: usize,
    /// Index into that platform's device list.
    pub device: usize,
    pub context: usize,
}

/// Select devices from `platforms` according to `config`.
pub fn select_devices(
    platforms: &[PlatformDevices],
    config: &OclConfig,
) -> Result<Vec<SelectedDevice>> {
    if platforms.is_empty() {
        return Err(OclError::NoPlatforms);
    }

    let matching = |p: &PlatformDevices| -> Vec<usize> {
        p.device_types
            .iter()
            .enumerate()
            .filter(|(_, t)| config.device_type.admits(**t))
            .map(|(i, _)| i)
            .collect()
    };

    let chosen: Vec<usize> = match &config.platform {
        PlatformSelector::First => {
            platforms.iter().position(|p| !matching(p).is_empty()).into_iter().collect()
        }
        PlatformSelector::All => (0..platforms.len()).collect(),
        PlatformSelector::Named(name) => {
            let idx = platforms.iter().position(|p| &p.name == name).ok_or_else(|| {
                OclError::NoDevice { reason: format!("no platform named '{name}'") }
            })?;
            vec![idx]
        }
    };

    let mut selected = Vec::new();
    let mut context = 0;
    for &p in &chosen {
        let devices = matching(&platforms[p]);
        if devices.is_empty() {
            continue;
        }
        debug!("platform '{}': {} matching device(s)", platforms[p].name, devices.len());
        selected.extend(devices.into_iter().map(|device| SelectedDevice { platform: p, device, context }));
        if config.platform.is_multi_platform() {
            context += 1;
        }
    }

    if selected.is_empty() {
        return Err(OclError::NoDevice {
            reason: format!("no {} devices on platform selection '{}'", config.device_type, config.platform),
        });
    }

    if let Some(specific) = config.select_specific_device {
        if specific >= selected.len() {
            return Err(ConfigError::Validation(format!(
                "SELECT_SPECIFIC_DEVICE {specific} out of range ({} devices available)",
                selected.len()
            ))
            .into());
        }
        let mut only = selected[specific];
        only.context = 0;
        selected = vec![only];
    }

    if let Some(max) = config.max_devices {
        selected.truncate(max);
    }

    if config.ocl_manager_verbose {
        info!("selected {} device(s) in {} context(s)", selected.len(), context.max(1));
    } else {
        debug!("selected {} device(s) in {} context(s)", selected.len(), context.max(1));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platforms() -> Vec<PlatformDevices> {
        vec![
            PlatformDevices { name: "cpu-only".into(), device_types: vec![DeviceTypeFilter::Cpu] },
            PlatformDevices {
                name: "gpus".into(),
                device_types: vec![DeviceTypeFilter::Gpu, DeviceTypeFilter::Gpu, DeviceTypeFilter::Cpu],
            },
        ]
    }

    #[test]
    fn first_platform_with_matching_devices() {
        let cfg = OclConfig { device_type: DeviceTypeFilter::Gpu, ..Default::default() };
        let sel = select_devices(&platforms(), &cfg).unwrap();
        assert_eq!(sel.len(), 2);
        assert!(sel.iter().all(|s| s.platform == 1 && s.context == 0));
        assert_eq!(sel[1].device, 1);
    }

    #[test]
    fn all_platforms_get_one_context_each() {
        let cfg = OclConfig { platform: PlatformSelector::All, ..Default::default() };
        let sel = select_devices(&platforms(), &cfg).unwrap();
        assert_eq!(sel.len(), 4);
        assert_eq!(sel[0].context, 0);
        assert_eq!(sel[3].context, 1);
    }

    #[test]
    fn named_platform_must_exist() {
        let cfg = OclConfig { platform: PlatformSelector::Named("missing".into()), ..Default::default() };
        let err = select_devices(&platforms(), &cfg).unwrap_err();
        assert!(err.to_string().contains("no platform named 'missing'"));
    }

    #[test]
    fn no_matching_type_is_no_device() {
        let cfg = OclConfig { device_type: DeviceTypeFilter::Accelerator, ..Default::default() };
        assert!(matches!(select_devices(&platforms(), &cfg), Err(OclError::NoDevice { .. })));
    }

    #[test]
    fn specific_device_and_max_devices() {
        let cfg = OclConfig {
            platform: PlatformSelector::All,
            select_specific_device: Some(2),
            ..Default::default()
        };
        let sel = select_devices(&platforms(), &cfg).unwrap();
        assert_eq!(sel, vec![SelectedDevice { platform: 1, device: 1, context: 0 }]);

        let cfg = OclConfig { platform: PlatformSelector::All, max_devices: Some(3), ..Default::default() };
        assert_eq!(select_devices(&platforms(), &cfg).unwrap().len(), 3);
    }

    #[test]
    fn specific_device_out_of_range() {
        let cfg = OclConfig { select_specific_device: Some(9), ..Default::default() };
        let err = select_devices(&platforms(), &cfg).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("SELECT_SPECIFIC_DEVICE 9"));
    }

    #[test]
    fn empty_platform_list() {
        assert!(matches!(select_devices(&[], &OclConfig::default()), Err(OclError::NoPlatforms)));
    }
}
