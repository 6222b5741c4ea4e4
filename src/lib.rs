//! Backup and restore orchestration for a web application's database and
//! uploaded media.
//!
//! A full backup dumps the database, archives the media directory, bundles
//! both into one zip under `backups/full`, prunes old bundles and optionally
//! pushes the result offsite. Runs are serialized by a named lock and gated
//! by a persisted schedule.

pub mod backup;
pub mod config;
pub mod errors;
pub mod restore;
pub mod utils;
