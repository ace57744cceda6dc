//! Script lookup by platform

use crate::container::Container;
use crate::error::{MissingScriptReason, ProvisionError, Result};
use crate::platform::PlatformKey;

/// Raw template text for `platform`, exactly as stored in the container.
///
/// # Errors
///
/// `MissingScript` when the platform has no index entry, when the row is
/// past the end of the script cells, or when the cell is empty.
pub fn materialize(container: &Container, platform: PlatformKey) -> Result<&str> {
    let missing = |reason| ProvisionError::MissingScript { platform, reason };

    let row = container
        .script_row(platform)
        .ok_or_else(|| missing(MissingScriptReason::NoEntry))?;

    let cells = container.scripts();
    let cell = cells.get(row).ok_or_else(|| {
        missing(MissingScriptReason::RowOutOfRange {
            row,
            available: cells.len(),
        })
    })?;

    let script = cell
        .as_deref()
        .ok_or_else(|| missing(MissingScriptReason::EmptyCell { row }))?;

    tracing::debug!(%platform, row, bytes = script.len(), "Script materialized");
    Ok(script)
}
