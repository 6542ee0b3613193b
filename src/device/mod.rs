//! Device coordinator
//!
//! One actor task per connected toy owns the session, the upload
//! coordinator, and the state cache; everything else talks to it through
//! the clonable `Furby` handle. Funneling all session-facing operations
//! through one task keeps request/response pairing unambiguous on the
//! single physical link.

mod actor;
mod handle;
pub mod info;

pub use handle::Furby;
pub use info::DeviceInfo;

use thiserror::Error;

use crate::cache::CacheError;
use crate::dlc::DlcError;
use crate::session::SessionError;

/// Well-known state-cache keys mirrored by the coordinator.
pub mod keys {
    use crate::protocol::MoodType;

    pub const ANTENNA: &str = "antenna";
    pub const NAME_ID: &str = "name_id";
    pub const LCD_BACKLIGHT: &str = "lcd_backlight";

    pub fn mood(mood: MoodType) -> String {
        format!("mood.{}", mood.key())
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Dlc(#[from] DlcError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("device task is gone")]
    TaskGone,
}
