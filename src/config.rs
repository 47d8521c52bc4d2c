use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fota::{AlignmentPolicy, FotaError, FotaParameters};

#[cfg(target_os = "espidf")]
const CONFIG_NAMESPACE: &str = "fota";
#[cfg(target_os = "espidf")]
const CONFIG_KEY: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FotaConfig {
    // Default update source, used until a trigger supplies its own
    pub server_name: String,
    pub server_port: u16,
    pub uri: String,

    // Device update protocol
    pub header_size: usize,
    pub write_alignment: usize,
    pub alignment_policy: AlignmentPolicy,

    // Timing
    pub http_timeout_ms: u64,
    pub reboot_delay_ms: u64,
    pub retry_backoff_ms: u64,
    pub retry_on_error: bool,
    /// Periodic update check armed at boot, off when `None`
    pub check_interval_ms: Option<u64>,

    // FOTA task
    pub task_stack_size: usize,
    pub task_name: String,
}

impl Default for FotaConfig {
    fn default() -> Self {
        Self {
            server_name: "192.168.8.105".to_string(),
            server_port: 8000,
            uri: "/download/st67w611m_mission_t01_v2.0.89.bin.ota".to_string(),
            header_size: 512,
            write_alignment: 256,
            alignment_policy: AlignmentPolicy::Rechunk,
            http_timeout_ms: 60_000,
            reboot_delay_ms: 16_000,
            retry_backoff_ms: 20_000,
            retry_on_error: true,
            check_interval_ms: None,
            task_stack_size: 8192,
            task_name: "fota-task".to_string(),
        }
    }
}

impl FotaConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: FotaConfig =
            serde_json::from_str(json).context("Invalid FOTA configuration JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), FotaError> {
        if self.header_size == 0 || self.write_alignment == 0 {
            log::error!(
                "Header size ({}) and write alignment ({}) must be non-zero",
                self.header_size,
                self.write_alignment
            );
            return Err(FotaError::InvalidConfig);
        }
        if self.http_timeout_ms == 0 || self.retry_backoff_ms == 0 {
            log::error!("HTTP timeout and retry backoff must be non-zero");
            return Err(FotaError::InvalidConfig);
        }
        if self.check_interval_ms == Some(0) {
            log::error!("Update check interval must be non-zero");
            return Err(FotaError::InvalidConfig);
        }
        self.default_parameters()
            .map(|_| ())
            .map_err(|_| FotaError::InvalidConfig)
    }

    /// Parameters the FOTA task starts with.
    pub fn default_parameters(&self) -> Result<FotaParameters, FotaError> {
        FotaParameters::new(&self.server_name, self.server_port, &self.uri)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn check_interval(&self) -> Option<Duration> {
        self.check_interval_ms.map(Duration::from_millis)
    }
}

#[cfg(target_os = "espidf")]
impl FotaConfig {
    pub fn save(&self, partition: esp_idf_svc::nvs::EspDefaultNvsPartition) -> Result<()> {
        save_to_nvs(partition, self)?;
        log::info!("FOTA configuration saved to NVS");
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub fn load_or_default(
    partition: esp_idf_svc::nvs::EspDefaultNvsPartition,
) -> Result<FotaConfig> {
    match load_from_nvs(partition.clone()) {
        Ok(config) => {
            log::info!("Loaded FOTA configuration from NVS");
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load FOTA config from NVS: {:?}, using defaults", e);
            let config = FotaConfig::default();

            // Store the defaults so they can be edited in place next time
            if let Err(save_err) = config.save(partition) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }

            Ok(config)
        }
    }
}

#[cfg(target_os = "espidf")]
fn load_from_nvs(partition: esp_idf_svc::nvs::EspDefaultNvsPartition) -> Result<FotaConfig> {
    use esp_idf_svc::nvs::EspNvs;

    let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 1024];
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("FOTA config not found in NVS"))?;

    let json = std::str::from_utf8(data)?;
    FotaConfig::from_json(json)
}

#[cfg(target_os = "espidf")]
fn save_to_nvs(
    partition: esp_idf_svc::nvs::EspDefaultNvsPartition,
    config: &FotaConfig,
) -> Result<()> {
    use esp_idf_svc::nvs::EspNvs;

    let mut nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
    let json = serde_json::to_vec(config)?;
    nvs.set_blob(CONFIG_KEY, &json)?;
    Ok(())
}
