#![deny(clippy::all)]

//! Client-side pipeline for remote evaluation of AI cancer detection in
//! mammography: extract pixel data and non-PHI metadata from local DICOM
//! files, package them into a bounded archive, submit it to the
//! evaluation service, and post-process the returned result tables.

pub mod archive;
pub mod extract;
pub mod plot;
pub mod results;
pub mod upload;
pub mod utils;
