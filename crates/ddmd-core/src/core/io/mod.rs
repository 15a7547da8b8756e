//! Binary checkpoint archives.
//!
//! Storages, boundaries and models implement [`archive::Archivable`] so that a
//! domain can write its complete state to any [`std::io::Write`] and read it
//! back with the same layout.

pub mod archive;
