//! Rowfence Core — tenant identity, JWT claim payloads, and the task and
//! settings domain models.

pub mod identity;
pub mod settings;
pub mod task;

pub use identity::{Claims, TenantIdentity};
pub use settings::{
    SettingsPatch, SettingsUpdate, Theme, UserSettings, DEFAULT_ACCENT_COLOR, DEFAULT_LANGUAGE,
    MAX_LANGUAGE_LEN, MIN_LANGUAGE_LEN,
};
pub use task::{NewTask, Task, TaskPatch, MAX_TITLE_LEN, MIN_DURATION_MINUTES};
