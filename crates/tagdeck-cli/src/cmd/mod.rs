pub mod config;
pub mod init;
pub mod playback;
pub mod run;
pub mod status;
