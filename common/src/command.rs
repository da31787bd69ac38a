use serde::Deserialize;

/// Closed command sets for the request families. Deserialization is the
/// validation boundary for the `action` discriminator: an unknown action
/// fails to parse instead of hitting a runtime default branch.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MoveCommand {
    Open,
    Close,
    Stop,
    Set { percent: f32 },
    Jog { steps: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CalibrateCommand {
    SetTop,
    SetBottom,
    Jog { steps: i32 },
    Reset,
}

/// Partial settings update; absent fields are untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    #[serde(rename = "travelSteps")]
    pub travel_steps: Option<i32>,
    #[serde(rename = "reverseDirection")]
    pub reverse_direction: Option<bool>,
    #[serde(rename = "maxSpeed")]
    pub max_speed: Option<f32>,
    pub acceleration: Option<f32>,
    #[serde(rename = "coilHoldMs")]
    pub coil_hold_ms: Option<u16>,
    #[serde(rename = "topOverdriveEnabled")]
    pub top_overdrive_enabled: Option<bool>,
    #[serde(rename = "topOverdrivePercent")]
    pub top_overdrive_percent: Option<f32>,
    #[serde(rename = "sunScheduleEnabled")]
    pub sun_schedule_enabled: Option<bool>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(rename = "sunriseOffsetMinutes")]
    pub sunrise_offset_minutes: Option<i16>,
    #[serde(rename = "sunsetOffsetMinutes")]
    pub sunset_offset_minutes: Option<i16>,
    #[serde(rename = "sunriseTargetPercent")]
    pub sunrise_target_percent: Option<f32>,
    #[serde(rename = "sunsetTargetPercent")]
    pub sunset_target_percent: Option<f32>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FirmwareConfigPatch {
    #[serde(rename = "firmwareRepo")]
    pub firmware_repo: Option<String>,
    #[serde(rename = "firmwareAssetName")]
    pub firmware_asset_name: Option<String>,
    #[serde(rename = "firmwareFsAssetName")]
    pub firmware_fs_asset_name: Option<String>,
}

fn default_include_filesystem() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLatestRequest {
    #[serde(
        rename = "includeFilesystem",
        default = "default_include_filesystem"
    )]
    pub include_filesystem: bool,
}

impl Default for UpdateLatestRequest {
    fn default() -> Self {
        Self {
            include_filesystem: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateReleaseRequest {
    pub tag: String,
    #[serde(
        rename = "includeFilesystem",
        default = "default_include_filesystem"
    )]
    pub include_filesystem: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateUrlRequest {
    #[serde(rename = "firmwareUrl", default)]
    pub firmware_url: String,
    #[serde(rename = "filesystemUrl", default)]
    pub filesystem_url: String,
    #[serde(
        rename = "includeFilesystem",
        default = "default_include_filesystem"
    )]
    pub include_filesystem: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_actions_parse() {
        let open: MoveCommand = serde_json::from_str(r#"{"action":"open"}"#).unwrap();
        assert_eq!(open, MoveCommand::Open);

        let set: MoveCommand = serde_json::from_str(r#"{"action":"set","percent":42.5}"#).unwrap();
        assert_eq!(set, MoveCommand::Set { percent: 42.5 });

        let jog: MoveCommand = serde_json::from_str(r#"{"action":"jog","steps":-200}"#).unwrap();
        assert_eq!(jog, MoveCommand::Jog { steps: -200 });
    }

    #[test]
    fn unknown_action_is_a_parse_error() {
        assert!(serde_json::from_str::<MoveCommand>(r#"{"action":"launch"}"#).is_err());
        assert!(serde_json::from_str::<CalibrateCommand>(r#"{"action":"open"}"#).is_err());
    }

    #[test]
    fn calibrate_actions_parse() {
        let top: CalibrateCommand = serde_json::from_str(r#"{"action":"set_top"}"#).unwrap();
        assert_eq!(top, CalibrateCommand::SetTop);

        let bottom: CalibrateCommand = serde_json::from_str(r#"{"action":"set_bottom"}"#).unwrap();
        assert_eq!(bottom, CalibrateCommand::SetBottom);
    }

    #[test]
    fn update_requests_default_filesystem_to_true() {
        let latest: UpdateLatestRequest = serde_json::from_str("{}").unwrap();
        assert!(latest.include_filesystem);

        let url: UpdateUrlRequest =
            serde_json::from_str(r#"{"firmwareUrl":"https://x/fw.bin","includeFilesystem":false}"#)
                .unwrap();
        assert!(!url.include_filesystem);
        assert!(url.filesystem_url.is_empty());
    }
}
