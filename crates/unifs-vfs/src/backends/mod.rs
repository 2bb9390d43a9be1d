//! Protocol adapters.
//!
//! - [`local`]: the local filesystem (`file://`)
//! - [`sftp`]: SSH file transfer (`sftp://`)
//! - [`gdrive`]: Google Drive (`gdrive://`)
//! - [`tar`]: read-only TAR archives (`tar://`)
//! - [`search`]: search results as a directory (`search://`)

pub mod gdrive;
pub mod local;
pub mod search;
pub mod sftp;
pub mod tar;
