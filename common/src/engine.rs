//! The controller core: one state machine owning the durable state, the
//! motion controller, the solar scheduler, and the update job, advanced by
//! a cooperative tick.
//!
//! Request handlers validate fully before mutating anything and persist
//! before returning, so a response implies the change is durable.

use chrono::{DateTime, FixedOffset};

use crate::command::{
    CalibrateCommand, FirmwareConfigPatch, MoveCommand, SettingsPatch, UpdateLatestRequest,
    UpdateReleaseRequest, UpdateUrlRequest,
};
use crate::config::{is_valid_firmware_repo, ControllerState, ShutterConfig, FIRMWARE_VERSION};
use crate::driver::StepperDriver;
use crate::math::{percent_to_steps, steps_to_percent};
use crate::motion::MotionController;
use crate::ota::{looks_like_http_url, NetworkLink, OtaManager, OtaRequest};
use crate::store::{LoadSource, StateStore};
use crate::sun::SunScheduler;
use crate::types::{ApiError, StatusSnapshot, UpdateCheck, UpdateImageCheck};

/// What the surrounding loop must act on after a tick.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub reboot_due: bool,
    /// Background save failure; surfaced for logging only, the loop keeps
    /// running and retries on later ticks.
    pub persist_error: Option<String>,
}

pub struct ShutterEngine<D: StepperDriver> {
    cfg: ShutterConfig,
    state: ControllerState,
    motion: MotionController<D>,
    sun: SunScheduler,
    ota: OtaManager,
    store: StateStore,
    load_source: LoadSource,
    dirty: bool,
    /// Forces the first save after boot so the record is always rewritten
    /// in the current schema.
    needs_resave: bool,
    wall_synced: bool,
    reboot_requested: bool,
}

impl<D: StepperDriver> ShutterEngine<D> {
    pub fn new(cfg: ShutterConfig, driver: D, mut store: StateStore) -> Self {
        let (state, load_source) = store.load(&cfg);
        let mut motion = MotionController::new(driver);
        motion.seed(&state);
        let ota = OtaManager::new(&cfg);
        let dirty = !matches!(load_source, LoadSource::Current);
        Self {
            cfg,
            state,
            motion,
            sun: SunScheduler::new(),
            ota,
            store,
            load_source,
            dirty,
            needs_resave: true,
            wall_synced: false,
            reboot_requested: false,
        }
    }

    pub fn load_source(&self) -> LoadSource {
        self.load_source
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn status(
        &mut self,
        now_ms: u64,
        wall: Option<DateTime<FixedOffset>>,
        link: &mut dyn NetworkLink,
    ) -> StatusSnapshot {
        let info = link.link_info();
        let position_steps = self.motion.current_logical(&self.state);
        let target_steps = self.motion.target();
        StatusSnapshot {
            ok: true,
            version: FIRMWARE_VERSION,
            ip: info.ip,
            ssid: info.ssid,
            rssi: info.rssi,
            uptime_sec: now_ms / 1000,
            motion: self.motion.phase(&self.state).as_str(),
            moving: self.motion.is_moving(),
            calibrated: self.state.calibrated,
            position_steps,
            target_steps,
            travel_steps: self.state.travel_steps,
            position_percent: steps_to_percent(position_steps, self.state.travel_steps),
            target_percent: steps_to_percent(target_steps, self.state.travel_steps),
            reverse_direction: self.state.reverse_direction,
            max_speed: self.state.max_speed,
            acceleration: self.state.acceleration,
            coil_hold_ms: self.state.coil_hold_ms,
            top_overdrive_enabled: self.state.top_overdrive_enabled,
            top_overdrive_percent: self.state.top_overdrive_percent,
            raw_position: self.motion.raw_position(),
            firmware_repo: self.state.firmware_repo.clone(),
            firmware_asset_name: self.state.firmware_asset_name.clone(),
            firmware_fs_asset_name: self.state.firmware_fs_asset_name.clone(),
            latitude: self.state.latitude,
            longitude: self.state.longitude,
            sunrise_offset_minutes: self.state.sunrise_offset_minutes,
            sunset_offset_minutes: self.state.sunset_offset_minutes,
            sun: self.sun.status(&self.state),
            ota: self.ota.status(),
            time_synced: wall.is_some(),
            timezone: self.state.timezone.clone(),
        }
    }

    fn persist(&mut self, now_ms: u64, force: bool) -> Result<(), ApiError> {
        self.state.current_position = self.motion.current_logical(&self.state);
        match self.store.save(&self.state, now_ms, force, self.dirty) {
            Ok(written) => {
                if written {
                    self.dirty = false;
                    self.needs_resave = false;
                }
                Ok(())
            }
            Err(err) => Err(ApiError::Persistence(err.to_string())),
        }
    }

    pub fn handle_move(&mut self, cmd: MoveCommand, now_ms: u64) -> Result<(), ApiError> {
        // Uncalibrated moves run against the default travel length; only
        // the solar scheduler insists on a measured travel.
        if !matches!(cmd, MoveCommand::Stop) && self.ota.is_busy() {
            return Err(ApiError::conflict("motion is locked during a firmware update"));
        }

        match cmd {
            MoveCommand::Open => self.motion.open_with_overdrive(&self.state),
            MoveCommand::Close => self.motion.move_to_logical(&self.state, self.state.travel_steps),
            MoveCommand::Stop => self.motion.stop(&self.state, now_ms),
            MoveCommand::Set { percent } => {
                if !(0.0..=100.0).contains(&percent) {
                    return Err(ApiError::validation("percent must be between 0 and 100"));
                }
                let target = percent_to_steps(percent, self.state.travel_steps);
                self.motion.move_to_logical(&self.state, target);
            }
            MoveCommand::Jog { steps } => self.motion.move_jog(&self.state, steps)?,
        }

        self.dirty = true;
        self.persist(now_ms, true)
    }

    pub fn handle_calibrate(&mut self, cmd: CalibrateCommand, now_ms: u64) -> Result<(), ApiError> {
        if self.ota.is_busy() {
            return Err(ApiError::conflict("motion is locked during a firmware update"));
        }

        match cmd {
            CalibrateCommand::SetTop => self.motion.calibrate_set_top(&mut self.state),
            CalibrateCommand::SetBottom => {
                self.motion.calibrate_set_bottom(&self.cfg, &mut self.state)?
            }
            CalibrateCommand::Jog { steps } => self.motion.calibrate_jog(&self.state, steps)?,
            CalibrateCommand::Reset => {
                self.motion.stop(&self.state, now_ms);
                self.state.calibrated = false;
            }
        }

        self.dirty = true;
        self.persist(now_ms, true)
    }

    pub fn handle_settings(&mut self, patch: SettingsPatch, now_ms: u64) -> Result<(), ApiError> {
        if let Some(travel) = patch.travel_steps {
            if !(self.cfg.min_travel_steps..=self.cfg.max_travel_steps).contains(&travel) {
                return Err(ApiError::validation("travelSteps out of range"));
            }
        }
        if let Some(speed) = patch.max_speed {
            if !(self.cfg.min_speed..=self.cfg.max_speed).contains(&speed) {
                return Err(ApiError::validation("maxSpeed out of range"));
            }
        }
        if let Some(accel) = patch.acceleration {
            if !(self.cfg.min_accel..=self.cfg.max_accel).contains(&accel) {
                return Err(ApiError::validation("acceleration out of range"));
            }
        }
        if let Some(hold) = patch.coil_hold_ms {
            if hold > self.cfg.max_coil_hold_ms {
                return Err(ApiError::validation("coilHoldMs out of range"));
            }
        }
        if let Some(percent) = patch.top_overdrive_percent {
            if !(0.0..=self.cfg.max_overdrive_percent).contains(&percent) {
                return Err(ApiError::validation("topOverdrivePercent out of range"));
            }
        }
        if let Some(lat) = patch.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(ApiError::validation("latitude out of range"));
            }
        }
        if let Some(lon) = patch.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(ApiError::validation("longitude out of range"));
            }
        }
        let offset_limit = self.cfg.max_sun_offset_minutes;
        for offset in [patch.sunrise_offset_minutes, patch.sunset_offset_minutes]
            .into_iter()
            .flatten()
        {
            if !(-offset_limit..=offset_limit).contains(&offset) {
                return Err(ApiError::validation("sun offset out of range"));
            }
        }
        for target in [patch.sunrise_target_percent, patch.sunset_target_percent]
            .into_iter()
            .flatten()
        {
            if !(0.0..=100.0).contains(&target) {
                return Err(ApiError::validation("sun target percent out of range"));
            }
        }
        if let Some(tz) = &patch.timezone {
            if tz.trim().is_empty() {
                return Err(ApiError::validation("timezone must not be empty"));
            }
        }

        let logical_before = self.motion.current_logical(&self.state);
        let mut remap = false;
        let mut reprofile = false;
        let mut sun_changed = false;

        if let Some(travel) = patch.travel_steps {
            if travel != self.state.travel_steps {
                self.state.travel_steps = travel;
                remap = true;
            }
        }
        if let Some(reverse) = patch.reverse_direction {
            if reverse != self.state.reverse_direction {
                self.state.reverse_direction = reverse;
                remap = true;
            }
        }
        if let Some(speed) = patch.max_speed {
            self.state.max_speed = speed;
            reprofile = true;
        }
        if let Some(accel) = patch.acceleration {
            self.state.acceleration = accel;
            reprofile = true;
        }
        if let Some(hold) = patch.coil_hold_ms {
            self.state.coil_hold_ms = hold;
        }
        if let Some(enabled) = patch.top_overdrive_enabled {
            self.state.top_overdrive_enabled = enabled;
        }
        if let Some(percent) = patch.top_overdrive_percent {
            self.state.top_overdrive_percent = percent;
        }
        if let Some(enabled) = patch.sun_schedule_enabled {
            sun_changed |= enabled != self.state.sun_schedule_enabled;
            self.state.sun_schedule_enabled = enabled;
        }
        if let Some(lat) = patch.latitude {
            sun_changed |= lat != self.state.latitude;
            self.state.latitude = lat;
        }
        if let Some(lon) = patch.longitude {
            sun_changed |= lon != self.state.longitude;
            self.state.longitude = lon;
        }
        if let Some(offset) = patch.sunrise_offset_minutes {
            sun_changed |= offset != self.state.sunrise_offset_minutes;
            self.state.sunrise_offset_minutes = offset;
        }
        if let Some(offset) = patch.sunset_offset_minutes {
            sun_changed |= offset != self.state.sunset_offset_minutes;
            self.state.sunset_offset_minutes = offset;
        }
        if let Some(target) = patch.sunrise_target_percent {
            self.state.sunrise_target_percent = target;
        }
        if let Some(target) = patch.sunset_target_percent {
            self.state.sunset_target_percent = target;
        }
        if let Some(tz) = patch.timezone {
            let tz = tz.trim().to_string();
            sun_changed |= tz != self.state.timezone;
            self.state.timezone = tz;
        }

        if remap {
            self.motion.reapply_bounds(&self.state, logical_before);
        } else if reprofile {
            self.motion.apply_profile(&self.state);
        }
        if sun_changed {
            self.sun.invalidate();
        }

        self.dirty = true;
        self.persist(now_ms, true)
    }

    pub fn set_firmware_config(
        &mut self,
        patch: FirmwareConfigPatch,
        now_ms: u64,
    ) -> Result<(), ApiError> {
        if let Some(repo) = &patch.firmware_repo {
            let repo = repo.trim();
            if !repo.is_empty() && !is_valid_firmware_repo(repo) {
                return Err(ApiError::validation(
                    "firmwareRepo must look like owner/repo",
                ));
            }
        }

        if let Some(repo) = patch.firmware_repo {
            self.state.firmware_repo = repo;
        }
        if let Some(asset) = patch.firmware_asset_name {
            self.state.firmware_asset_name = asset;
        }
        if let Some(asset) = patch.firmware_fs_asset_name {
            self.state.firmware_fs_asset_name = asset;
        }
        // Empty fields roll back to the built-in defaults.
        self.state.normalize_firmware_config();

        self.dirty = true;
        self.persist(now_ms, true)
    }

    fn latest_release_urls(&self) -> (String, String) {
        let repo = &self.state.firmware_repo;
        (
            format!(
                "https://github.com/{repo}/releases/latest/download/{}",
                self.state.firmware_asset_name
            ),
            format!(
                "https://github.com/{repo}/releases/latest/download/{}",
                self.state.firmware_fs_asset_name
            ),
        )
    }

    fn tagged_release_urls(&self, tag: &str) -> (String, String) {
        let repo = &self.state.firmware_repo;
        (
            format!(
                "https://github.com/{repo}/releases/download/{tag}/{}",
                self.state.firmware_asset_name
            ),
            format!(
                "https://github.com/{repo}/releases/download/{tag}/{}",
                self.state.firmware_fs_asset_name
            ),
        )
    }

    /// Availability probe for the latest release; does not change any
    /// state and never enqueues a job.
    pub fn check_update_latest(
        &mut self,
        include_filesystem: bool,
        link: &mut dyn NetworkLink,
    ) -> UpdateCheck {
        let (firmware_url, filesystem_url) = self.latest_release_urls();
        let network = link.probe_release_host();
        let network_ok = network.is_ok();
        let network_error = network.err().unwrap_or_default();

        let firmware = UpdateImageCheck {
            ok: network_ok && looks_like_http_url(&firmware_url),
            url_format_ok: looks_like_http_url(&firmware_url),
        };
        let filesystem = UpdateImageCheck {
            ok: network_ok && looks_like_http_url(&filesystem_url),
            url_format_ok: looks_like_http_url(&filesystem_url),
        };

        let ok = firmware.ok && (!include_filesystem || filesystem.ok);
        let error = if ok {
            None
        } else if !network_ok {
            Some(format!("release host unreachable: {network_error}"))
        } else {
            Some("release asset URL is malformed".to_string())
        };

        UpdateCheck {
            ok,
            firmware_url,
            filesystem_url,
            network_ok,
            network_error,
            firmware,
            filesystem,
            error,
        }
    }

    pub fn enqueue_update_latest(
        &mut self,
        req: UpdateLatestRequest,
        now_ms: u64,
    ) -> Result<(), ApiError> {
        let (firmware_url, filesystem_url) = self.latest_release_urls();
        self.ota.enqueue(
            OtaRequest {
                source: "latest".to_string(),
                release_tag: String::new(),
                firmware_url,
                filesystem_url,
                include_filesystem: req.include_filesystem,
            },
            now_ms,
        )
    }

    pub fn enqueue_update_release(
        &mut self,
        req: UpdateReleaseRequest,
        now_ms: u64,
    ) -> Result<(), ApiError> {
        let tag = req.tag.trim();
        if tag.is_empty() {
            return Err(ApiError::validation("release tag is required"));
        }
        let (firmware_url, filesystem_url) = self.tagged_release_urls(tag);
        self.ota.enqueue(
            OtaRequest {
                source: "release".to_string(),
                release_tag: tag.to_string(),
                firmware_url,
                filesystem_url,
                include_filesystem: req.include_filesystem,
            },
            now_ms,
        )
    }

    pub fn enqueue_update_url(
        &mut self,
        req: UpdateUrlRequest,
        now_ms: u64,
    ) -> Result<(), ApiError> {
        let firmware_url = req.firmware_url.trim().to_string();
        if !looks_like_http_url(&firmware_url) {
            return Err(ApiError::validation("firmwareUrl must be an http(s) URL"));
        }
        let filesystem_url = req.filesystem_url.trim().to_string();
        if req.include_filesystem && !looks_like_http_url(&filesystem_url) {
            return Err(ApiError::validation(
                "filesystemUrl must be an http(s) URL when the filesystem image is included",
            ));
        }
        self.ota.enqueue(
            OtaRequest {
                source: "url".to_string(),
                release_tag: String::new(),
                firmware_url,
                filesystem_url,
                include_filesystem: req.include_filesystem,
            },
            now_ms,
        )
    }

    /// Clears the stored network credentials and schedules a restart so
    /// the configuration portal comes back up.
    pub fn reset_network_credentials(&mut self, link: &mut dyn NetworkLink) -> Result<(), ApiError> {
        link.reset_credentials().map_err(ApiError::Internal)?;
        self.reboot_requested = true;
        Ok(())
    }

    pub fn request_reboot(&mut self) {
        self.reboot_requested = true;
    }

    pub fn ota_busy(&self) -> bool {
        self.ota.is_busy()
    }

    /// One cooperative tick: update job first, then solar triggers, then
    /// motion, then the throttled save.
    pub fn tick(
        &mut self,
        now_ms: u64,
        wall: Option<DateTime<FixedOffset>>,
        link: &mut dyn NetworkLink,
    ) -> TickOutcome {
        if self.ota.start_due(now_ms) {
            // Quiesce before flashing: no motion, coils cold, state durable.
            self.motion.stop(&self.state, now_ms);
            self.motion.release_coils();
            let _ = self.persist(now_ms, true);
            self.ota.begin(now_ms);
        }
        let ota_reboot = self.ota.advance(now_ms, link);

        match wall {
            Some(_) => self.wall_synced = true,
            None => {
                // Wall-clock sync lost; cached instants are no longer
                // trustworthy.
                if self.wall_synced {
                    self.sun.invalidate();
                }
                self.wall_synced = false;
            }
        }
        if let Some(wall) = wall {
            if !self.ota.is_busy() && self.state.calibrated && self.state.sun_schedule_enabled {
                let triggers = self.sun.evaluate(&self.state, wall);
                if triggers.sunrise {
                    let target =
                        percent_to_steps(self.state.sunrise_target_percent, self.state.travel_steps);
                    self.motion.move_to_logical(&self.state, target);
                    self.dirty = true;
                }
                // When both cross in one tick the sunset target wins.
                if triggers.sunset {
                    let target =
                        percent_to_steps(self.state.sunset_target_percent, self.state.travel_steps);
                    self.motion.move_to_logical(&self.state, target);
                    self.dirty = true;
                }
            }
        }

        let motion_tick = self.motion.run(&self.state, now_ms);
        if motion_tick.position_changed {
            self.dirty = true;
        }

        let force = motion_tick.just_stopped || self.needs_resave;
        let persist_error = self.persist(now_ms, force).err().map(|e| e.to_string());

        TickOutcome {
            reboot_due: ota_reboot || self.reboot_requested,
            persist_error,
        }
    }
}
