use serde::{Deserialize, Serialize};

use crate::math::{clamp_f32, clamp_f64, clamp_i32};

pub const FIRMWARE_VERSION: &str = "0.2.0-rs";

pub const DEFAULT_FIRMWARE_REPO: &str = "dslimp/shutter";
pub const DEFAULT_FIRMWARE_ASSET: &str = "firmware.bin";
pub const DEFAULT_FIRMWARE_FS_ASSET: &str = "littlefs.bin";
pub const DEFAULT_TIMEZONE: &str = "Europe/Moscow";

/// Fixed tuning limits and timing for one controller build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutterConfig {
    pub min_travel_steps: i32,
    pub max_travel_steps: i32,
    pub min_speed: f32,
    pub max_speed: f32,
    pub min_accel: f32,
    pub max_accel: f32,
    pub max_coil_hold_ms: u16,
    pub max_overdrive_percent: f32,
    pub max_sun_offset_minutes: i16,
    pub save_interval_ms: u64,
    pub ota_settle_delay_ms: u64,
    pub ota_retry_backoff_ms: u64,
    pub ota_max_attempts: u8,
    pub ota_reboot_grace_ms: u64,
}

impl Default for ShutterConfig {
    fn default() -> Self {
        Self {
            min_travel_steps: 100,
            max_travel_steps: 300_000,
            min_speed: 80.0,
            max_speed: 2500.0,
            min_accel: 40.0,
            max_accel: 6000.0,
            max_coil_hold_ms: 10_000,
            max_overdrive_percent: 10.0,
            max_sun_offset_minutes: 240,
            save_interval_ms: 5_000,
            ota_settle_delay_ms: 1_500,
            ota_retry_backoff_ms: 5_000,
            ota_max_attempts: 3,
            ota_reboot_grace_ms: 750,
        }
    }
}

/// The single authoritative durable record: calibration, motion profile,
/// solar schedule, firmware source, and the boot position hint.
///
/// The serde projection doubles as the human-readable mirror format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    #[serde(rename = "travelSteps")]
    pub travel_steps: i32,
    /// Last persisted logical position; only used to seed the driver on boot.
    #[serde(rename = "currentPosition")]
    pub current_position: i32,
    pub calibrated: bool,
    #[serde(rename = "reverseDirection")]
    pub reverse_direction: bool,
    #[serde(rename = "maxSpeed")]
    pub max_speed: f32,
    pub acceleration: f32,
    #[serde(rename = "coilHoldMs")]
    pub coil_hold_ms: u16,
    #[serde(rename = "topOverdriveEnabled")]
    pub top_overdrive_enabled: bool,
    #[serde(rename = "topOverdrivePercent")]
    pub top_overdrive_percent: f32,
    #[serde(rename = "sunScheduleEnabled")]
    pub sun_schedule_enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "sunriseOffsetMinutes")]
    pub sunrise_offset_minutes: i16,
    #[serde(rename = "sunsetOffsetMinutes")]
    pub sunset_offset_minutes: i16,
    #[serde(rename = "sunriseTargetPercent")]
    pub sunrise_target_percent: f32,
    #[serde(rename = "sunsetTargetPercent")]
    pub sunset_target_percent: f32,
    #[serde(rename = "firmwareRepo")]
    pub firmware_repo: String,
    #[serde(rename = "firmwareAssetName")]
    pub firmware_asset_name: String,
    #[serde(rename = "firmwareFsAssetName")]
    pub firmware_fs_asset_name: String,
    pub timezone: String,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            travel_steps: 12_000,
            current_position: 0,
            calibrated: false,
            reverse_direction: false,
            max_speed: 700.0,
            acceleration: 350.0,
            coil_hold_ms: 500,
            top_overdrive_enabled: false,
            top_overdrive_percent: 2.0,
            sun_schedule_enabled: false,
            latitude: 0.0,
            longitude: 0.0,
            sunrise_offset_minutes: 0,
            sunset_offset_minutes: 0,
            sunrise_target_percent: 0.0,
            sunset_target_percent: 100.0,
            firmware_repo: DEFAULT_FIRMWARE_REPO.to_string(),
            firmware_asset_name: DEFAULT_FIRMWARE_ASSET.to_string(),
            firmware_fs_asset_name: DEFAULT_FIRMWARE_FS_ASSET.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

impl ControllerState {
    pub fn sanitize(&mut self, cfg: &ShutterConfig) {
        self.travel_steps = clamp_i32(
            self.travel_steps,
            cfg.min_travel_steps,
            cfg.max_travel_steps,
        );
        self.current_position = clamp_i32(self.current_position, 0, self.travel_steps);
        self.max_speed = clamp_f32(self.max_speed, cfg.min_speed, cfg.max_speed);
        self.acceleration = clamp_f32(self.acceleration, cfg.min_accel, cfg.max_accel);
        self.coil_hold_ms = self.coil_hold_ms.min(cfg.max_coil_hold_ms);
        self.top_overdrive_percent =
            clamp_f32(self.top_overdrive_percent, 0.0, cfg.max_overdrive_percent);
        self.latitude = clamp_f64(self.latitude, -90.0, 90.0);
        self.longitude = clamp_f64(self.longitude, -180.0, 180.0);
        self.sunrise_offset_minutes = self
            .sunrise_offset_minutes
            .clamp(-cfg.max_sun_offset_minutes, cfg.max_sun_offset_minutes);
        self.sunset_offset_minutes = self
            .sunset_offset_minutes
            .clamp(-cfg.max_sun_offset_minutes, cfg.max_sun_offset_minutes);
        self.sunrise_target_percent = clamp_f32(self.sunrise_target_percent, 0.0, 100.0);
        self.sunset_target_percent = clamp_f32(self.sunset_target_percent, 0.0, 100.0);
        self.normalize_firmware_config();
        if self.timezone.trim().is_empty() {
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
    }

    /// Trims the firmware source fields, falls back to defaults for empty
    /// assets, and rejects a malformed repo identifier to the default so a
    /// bad persisted value can never reach URL construction.
    pub fn normalize_firmware_config(&mut self) {
        self.firmware_repo = self.firmware_repo.trim().to_string();
        self.firmware_asset_name = self.firmware_asset_name.trim().to_string();
        self.firmware_fs_asset_name = self.firmware_fs_asset_name.trim().to_string();
        if !is_valid_firmware_repo(&self.firmware_repo) {
            self.firmware_repo = DEFAULT_FIRMWARE_REPO.to_string();
        }
        if self.firmware_asset_name.is_empty() {
            self.firmware_asset_name = DEFAULT_FIRMWARE_ASSET.to_string();
        }
        if self.firmware_fs_asset_name.is_empty() {
            self.firmware_fs_asset_name = DEFAULT_FIRMWARE_FS_ASSET.to_string();
        }
    }
}

/// Repo identifier must be exactly `owner/repo` with non-empty halves.
pub fn is_valid_firmware_repo(value: &str) -> bool {
    let mut parts = value.splitn(2, '/');
    let owner = parts.next().unwrap_or("");
    let repo = parts.next().unwrap_or("");
    !owner.is_empty() && !repo.is_empty() && !repo.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_clamps_into_allowed_ranges() {
        let cfg = ShutterConfig::default();
        let mut state = ControllerState {
            travel_steps: 5,
            current_position: 900_000,
            max_speed: 1.0,
            acceleration: 100_000.0,
            coil_hold_ms: 60_000,
            top_overdrive_percent: 55.0,
            latitude: 123.0,
            longitude: -999.0,
            sunrise_offset_minutes: 10_000,
            sunset_offset_minutes: -10_000,
            sunrise_target_percent: 140.0,
            sunset_target_percent: -1.0,
            firmware_repo: "   ".to_string(),
            timezone: "".to_string(),
            ..ControllerState::default()
        };
        state.sanitize(&cfg);

        assert_eq!(state.travel_steps, cfg.min_travel_steps);
        assert_eq!(state.current_position, cfg.min_travel_steps);
        assert_eq!(state.max_speed, cfg.min_speed);
        assert_eq!(state.acceleration, cfg.max_accel);
        assert_eq!(state.coil_hold_ms, cfg.max_coil_hold_ms);
        assert_eq!(state.top_overdrive_percent, cfg.max_overdrive_percent);
        assert_eq!(state.latitude, 90.0);
        assert_eq!(state.longitude, -180.0);
        assert_eq!(state.sunrise_offset_minutes, cfg.max_sun_offset_minutes);
        assert_eq!(state.sunset_offset_minutes, -cfg.max_sun_offset_minutes);
        assert_eq!(state.sunrise_target_percent, 100.0);
        assert_eq!(state.sunset_target_percent, 0.0);
        assert_eq!(state.firmware_repo, DEFAULT_FIRMWARE_REPO);
        assert_eq!(state.timezone, DEFAULT_TIMEZONE);
    }

    #[test]
    fn normalize_rejects_malformed_repo() {
        for bad in ["a/b/c", "noslash", "/leading", "trailing/"] {
            let mut state = ControllerState {
                firmware_repo: bad.to_string(),
                ..ControllerState::default()
            };
            state.normalize_firmware_config();
            assert_eq!(state.firmware_repo, DEFAULT_FIRMWARE_REPO, "{bad}");
        }

        let mut state = ControllerState {
            firmware_repo: "  someone/blinds  ".to_string(),
            ..ControllerState::default()
        };
        state.normalize_firmware_config();
        assert_eq!(state.firmware_repo, "someone/blinds");
    }

    #[test]
    fn firmware_repo_shape() {
        assert!(is_valid_firmware_repo("dslimp/shutter"));
        assert!(is_valid_firmware_repo("a/b"));
        assert!(!is_valid_firmware_repo("noslash"));
        assert!(!is_valid_firmware_repo("/leading"));
        assert!(!is_valid_firmware_repo("trailing/"));
        assert!(!is_valid_firmware_repo("too/many/parts"));
        assert!(!is_valid_firmware_repo(""));
    }
}
