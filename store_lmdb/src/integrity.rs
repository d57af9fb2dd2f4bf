//! LMDB database integrity checks.
//!
//! Run on startup to detect corruption early, before the node starts
//! consuming blocks.

use std::path::Path;

use heed::types::Bytes;
use heed::Env;

use crate::environment::DATABASES;
use crate::LmdbError;

/// Summary of an integrity check run.
#[derive(Debug)]
pub struct IntegrityReport {
    pub databases_checked: u32,
    pub total_entries: u64,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Open each expected database and count its entries. Read failures are
/// recorded in the report rather than raised.
pub fn check_integrity(env: &Env) -> Result<IntegrityReport, LmdbError> {
    let mut report = IntegrityReport {
        databases_checked: 0,
        total_entries: 0,
        errors: Vec::new(),
    };

    let rtxn = env.read_txn()?;
    for &db_name in DATABASES {
        match env.open_database::<Bytes, Bytes>(&rtxn, Some(db_name)) {
            Ok(Some(db)) => {
                report.databases_checked += 1;
                match db.len(&rtxn) {
                    Ok(count) => report.total_entries += count,
                    Err(e) => report
                        .errors
                        .push(format!("failed to read database '{db_name}': {e}")),
                }
            }
            Ok(None) => report
                .errors
                .push(format!("database '{db_name}' is missing")),
            Err(e) => report
                .errors
                .push(format!("failed to open database '{db_name}': {e}")),
        }
    }

    Ok(report)
}

/// Check that an existing data directory holds an LMDB file.
///
/// A missing directory is a fresh start and passes.
pub fn check_data_dir(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Ok(());
    }
    let data_file = path.join("data.mdb");
    if path.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) && !data_file.exists() {
        return Err(format!(
            "directory is not empty but data.mdb is missing at {}",
            path.display()
        ));
    }
    Ok(())
}
