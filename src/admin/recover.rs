use std::path::Path;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_data_dir;
use crate::admin::Result;
use crate::recovery::{self, RecoveryOutcome};

/// Runs crash recovery on a data directory.
///
/// Problems with the log or the pages are part of the returned
/// [`RecoveryOutcome`]; an `Err` means the directory could not be opened
/// at all.
pub fn recover(dir: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<RecoveryOutcome> {
    let data = open_data_dir(dir.as_ref(), opts, opts.recovery.read_only)?;
    let env = data.env(opts)?;
    Ok(recovery::recover(&env, opts.recovery.clone()))
}
