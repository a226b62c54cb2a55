mod intake;
mod orchestrator;
mod worker;

pub use intake::PeerIntake;
pub use orchestrator::{Download, DownloadChannels};
