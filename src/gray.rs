//! Gray-release selection.
//!
//! Devices are bucketed with 32-bit FNV-1a over `device_id + gray_code_id`.
//! The hash has no per-process seed, so a device stays in its bucket across
//! restarts.

use anyhow::Result;

use crate::model::{Code, Config};

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// Bucket in `0..100` for a device under a given gray code version.
pub fn bucket(device_id: &str, gray_code_id: &str) -> u32 {
    let mut key = String::with_capacity(device_id.len() + gray_code_id.len());
    key.push_str(device_id);
    key.push_str(gray_code_id);
    fnv1a32(key.as_bytes()) % 100
}

pub fn is_gray_hit(config: &Config, device_id: &str) -> bool {
    config.percentage > 0 && bucket(device_id, &config.gray_release_code) < config.percentage
}

/// Code version picked for a device.
#[derive(Clone, Debug)]
pub struct Selection {
    pub code: Code,
    pub is_gray: bool,
}

/// Pick the gray code for hit devices and the stable code otherwise.
///
/// A gray code that cannot be resolved or is marked broken falls back to the
/// stable release. Resolution errors for the stable code are returned.
pub fn select_code<F>(config: &Config, device_id: &str, mut resolve: F) -> Result<Selection>
where
    F: FnMut(&str) -> Result<Code>,
{
    if is_gray_hit(config, device_id) {
        match resolve(&config.gray_release_code) {
            Ok(code) if !code.is_broken => return Ok(Selection { code, is_gray: true }),
            Ok(code) => log::warn!(
                "gray release code {} for config {} is broken, using stable release",
                code.code_id,
                config.config_id
            ),
            Err(err) => log::warn!(
                "fail to find gray release code {} for config {}: {:#}",
                config.gray_release_code,
                config.config_id,
                err
            ),
        }
    }

    let code = resolve(&config.released_code)?;
    Ok(Selection {
        code,
        is_gray: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn config(percentage: u32) -> Config {
        Config {
            config_id: "100000".to_string(),
            released_code: "stable".to_string(),
            gray_release_code: "gray".to_string(),
            percentage,
            status: "valid".to_string(),
            ..Config::default()
        }
    }

    fn code(id: &str, broken: bool) -> Code {
        Code {
            code_id: id.to_string(),
            lang: "starlark".to_string(),
            content: String::new(),
            is_broken: broken,
            ..Code::default()
        }
    }

    #[test]
    fn fnv1a32_matches_reference_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn bucketing_is_deterministic() {
        assert_eq!(bucket("3", "gray"), 33);
        assert_eq!(bucket("1", "gray"), 91);
        for _ in 0..10 {
            assert_eq!(bucket("device-a", "gray"), bucket("device-a", "gray"));
        }
    }

    #[test]
    fn zero_percentage_never_hits() {
        assert!(!is_gray_hit(&config(0), "device-d"));
    }

    #[test]
    fn raising_percentage_never_drops_a_hit_device() {
        let devices: Vec<String> = (0..200).map(|i| format!("device-{i}")).collect();
        let mut previous = 0;
        for percentage in [0, 10, 25, 50, 75, 100] {
            let cfg = config(percentage);
            let hits: Vec<&String> = devices.iter().filter(|d| is_gray_hit(&cfg, d)).collect();
            assert!(hits.len() >= previous);
            let lower = config(percentage.saturating_sub(10));
            for device in devices.iter().filter(|d| is_gray_hit(&lower, d)) {
                assert!(is_gray_hit(&cfg, device));
            }
            previous = hits.len();
        }
        assert_eq!(previous, devices.len());
    }

    #[test]
    fn hit_device_gets_gray_code() {
        let selection = select_code(&config(50), "3", |id| Ok(code(id, false))).unwrap();
        assert!(selection.is_gray);
        assert_eq!(selection.code.code_id, "gray");

        let selection = select_code(&config(50), "1", |id| Ok(code(id, false))).unwrap();
        assert!(!selection.is_gray);
        assert_eq!(selection.code.code_id, "stable");
    }

    #[test]
    fn broken_or_missing_gray_code_falls_back_to_stable() {
        let selection = select_code(&config(50), "3", |id| Ok(code(id, id == "gray"))).unwrap();
        assert!(!selection.is_gray);
        assert_eq!(selection.code.code_id, "stable");

        let selection = select_code(&config(50), "3", |id| {
            if id == "gray" {
                Err(anyhow!("not found"))
            } else {
                Ok(code(id, false))
            }
        })
        .unwrap();
        assert_eq!(selection.code.code_id, "stable");
    }

    #[test]
    fn stable_lookup_failure_is_returned() {
        let result = select_code(&config(0), "1", |_| Err(anyhow!("not found")));
        assert!(result.is_err());
    }
}
