// ─────────────────────────────────────────────────────────────────────────────
//  esp32_flasher  -  public library API
//
//  Pipeline used by the CLI (and any other front end):
//
//    detect::scan()            -> DeviceCandidate list
//    MetadataClient::fetch()   -> FirmwareDescriptor list
//    Resolver::resolve_*()     -> FirmwareSet        (Phase::Download)
//    Flasher::flash()          -> FlashReport        (Phase::Flash)
//
//  Long operations take a CancelToken and return Outcome::Cancelled rather
//  than an error when it fires.
// ─────────────────────────────────────────────────────────────────────────────

pub mod cancel;
pub mod detect;
pub mod error;
pub mod esptool;
pub mod firmware;
pub mod metadata;
pub mod progress;
pub mod settings;

pub use cancel::{CancelToken, Outcome};
pub use detect::DeviceCandidate;
pub use error::{FlashError, Result};
pub use esptool::{FlashParams, FlashReport, FlashState, Flasher};
pub use firmware::cache::FirmwareCache;
pub use firmware::resolve::Resolver;
pub use firmware::{FirmwareSet, FlashImage, ImageRole};
pub use metadata::{FirestoreStore, FirmwareDescriptor, MetadataClient};
pub use progress::{Phase, ProgressHub, ProgressUpdate, Reporter};
pub use settings::{Settings, SettingsStore};
