//! Core functionality modules for AppMan
//!
//! This module contains the lifecycle state machine and the components it
//! drives: profile registry, dependency resolver, PATH editor and the
//! installed-programs database.

pub mod config;
pub mod database;
pub mod orchestrator;
pub mod path_env;
pub mod profile;
pub mod registry;
pub mod resolver;
pub mod shortcut;
