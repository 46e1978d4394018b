pub mod config;
pub mod disk;
pub mod error;
pub mod inventory;
pub mod launcher;
pub mod platform;
pub mod playlist;
pub mod reconciler;
pub mod resolver;
pub mod station;
pub mod store;

pub use error::{RecorderError, ResolveError, Result};
pub use reconciler::{Recorder, RecorderSettings};
