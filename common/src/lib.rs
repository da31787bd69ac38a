//! Platform-independent core of the shutter controller: position math,
//! the durable state store, motion control, the solar scheduler, and the
//! firmware update job. Everything here is synchronous and I/O-free; the
//! binary crate supplies the drivers, the clock, and the network link.

pub mod command;
pub mod config;
pub mod driver;
pub mod engine;
pub mod math;
pub mod motion;
pub mod ota;
pub mod store;
pub mod sun;
pub mod types;

pub use command::{
    CalibrateCommand, FirmwareConfigPatch, MoveCommand, SettingsPatch, UpdateLatestRequest,
    UpdateReleaseRequest, UpdateUrlRequest,
};
pub use config::{ControllerState, ShutterConfig, FIRMWARE_VERSION};
pub use driver::{SoftStepper, StepperDriver};
pub use engine::{ShutterEngine, TickOutcome};
pub use ota::{ImageKind, NetworkLink, OtaState};
pub use store::{ByteStore, LoadSource, MirrorStore, StateStore, StoreError};
pub use sun::{solar_events_utc, SolarEvents, SunScheduler};
pub use types::{ApiError, LinkInfo, StatusSnapshot, UpdateCheck};
