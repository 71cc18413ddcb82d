pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod fs_util;
pub mod hyperlocal;
pub mod join;
pub mod merge;
pub mod osm;
pub mod output;
pub mod region;
pub mod resume;
pub mod units;
