//! dolphin-update - keeps a Dolphin emulator development build current
//!
//! Scrapes the download page for the newest build, downloads and unpacks
//! it, and swaps it into the install folder so that a failed update always
//! leaves the previous build in place.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod downloaders;
pub mod launch;
pub mod paths;
pub mod runner;
pub mod store;
pub mod updater;
