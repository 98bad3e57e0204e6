pub mod app;
pub mod cds;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod mapping;
pub mod merge;
pub mod netcdf;
pub mod output;
pub mod split;
pub mod status;
pub mod store;
pub mod verify;
