pub mod training;

pub use training::{LaunchError, LaunchSummary, TrainerLaunch};
