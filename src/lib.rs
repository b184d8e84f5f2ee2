//! Library to take consistent, verifiable backups of local files,
//! directories and MySQL/MariaDB instances.
//!
//! A run is driven by the [`orchestrator::BackupOrchestrator`]: every
//! [`target::TargetRequest`] is resolved into a [`target::Target`], executed
//! by one of the [`backends`] with bounded [`retry`]s, checked by the
//! [`verify`] module, atomically published and recorded in the append-only
//! [`manifest`].
//!
//! External processes (`cp`, `mysqldump`) are only ever started through a
//! [`runner::CommandRunner`], which makes every component testable without
//! touching real data.

#![forbid(unsafe_code)]

pub mod backends;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod target;
pub mod verify;
