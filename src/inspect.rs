//! Read-only device listing

use crate::backend::{DeviceBackend, DeviceId};
use crate::errors::Result;
use std::fmt::Display;
use std::io::Write;

fn or_na<T: Display>(value: Result<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|_| "n/a".to_string())
}

fn write_device(backend: &dyn DeviceBackend, device: DeviceId, out: &mut dyn Write) -> Result<()> {
    let info = backend.device_info(device).unwrap_or_default();
    let range = match backend.fan_bounds(device) {
        Ok((min, max)) => format!("{}-{}", min, max),
        Err(_) => "n/a".to_string(),
    };

    writeln!(out, "{:2}: {} (s/n: {}) - {}", device, info.name, info.serial, info.uuid)?;
    writeln!(
        out,
        "  +- Temp: {} Max temp: {}",
        or_na(backend.temperature(device)),
        or_na(backend.max_temp_threshold(device))
    )?;
    for fan in 0..backend.num_fans(device).unwrap_or(0) {
        writeln!(
            out,
            "  +- Fan: {} Speed: {} Range: {} Policy: {}",
            fan,
            or_na(backend.fan_speed(device, fan)),
            range,
            or_na(backend.fan_control_mode(device, fan))
        )?;
    }
    Ok(())
}

/// Print every device with its temperature and fans. Never changes fan state.
pub fn list_devices(backend: &dyn DeviceBackend, out: &mut dyn Write) -> Result<()> {
    for device in 0..backend.device_count()? {
        write_device(backend, device, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimDeviceSpec, SimulatedBackend};

    #[test]
    fn test_list_devices() {
        let backend = SimulatedBackend::from_specs(vec![
            SimDeviceSpec {
                name: "Test GPU".to_string(),
                ..SimDeviceSpec::default()
            },
            SimDeviceSpec {
                fans: 1,
                ..SimDeviceSpec::default()
            },
        ]);
        backend.pin_temperature(0, 47);
        backend.set_fan_speed(0, 1, 65).unwrap();
        backend.fail_reads(1, true);

        let mut out = Vec::new();
        list_devices(&backend, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 7);
        assert_eq!(
            lines[0],
            " 0: Test GPU (s/n: SIM00000000) - GPU-00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(lines[1], "  +- Temp: 47 Max temp: 83");
        assert_eq!(lines[2], "  +- Fan: 0 Speed: 30 Range: 30-100 Policy: auto");
        assert_eq!(lines[3], "  +- Fan: 1 Speed: 30 Range: 30-100 Policy: manual");
        assert_eq!(lines[5], "  +- Temp: n/a Max temp: 83");
        assert_eq!(lines[6], "  +- Fan: 0 Speed: 30 Range: 30-100 Policy: n/a");
        // Listing only reads
        assert_eq!(backend.calls().len(), 1);
    }
}
