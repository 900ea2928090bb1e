use std::path::Path;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_data_dir;
use crate::admin::Result;
use crate::recovery::{scan_pending, PendingReport};

/// Lists how many redo records wait for each page, without changing
/// anything in the directory.
pub fn pending(dir: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<PendingReport> {
    let data = open_data_dir(dir.as_ref(), opts, true)?;
    let env = data.env(opts)?;
    Ok(scan_pending(&env, opts.recovery.clone())?)
}
