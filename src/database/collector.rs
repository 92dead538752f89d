//! Cursor Collector: drains a forward cursor into one ordered list.

use super::request::Handlers;
use crate::engine::Cursor;
use crate::error::Result;
use serde_json::Value;

/// Build the cursor callback for a scan.
///
/// Each step appends the current value and advances; the end of the cursor
/// settles `handlers` with everything collected. An error settles them with
/// the error and the partial list is dropped. The accumulator belongs to
/// this one scan.
pub(crate) fn collect_values(
    handlers: Handlers<Vec<Value>>,
) -> impl FnMut(Result<Option<Cursor>>) + Send + 'static {
    let mut pending = Some((handlers, Vec::new()));

    move |step| {
        let Some((handlers, mut values)) = pending.take() else {
            return;
        };
        match step {
            Ok(Some(cursor)) => {
                values.push(cursor.value().clone());
                pending = Some((handlers, values));
                cursor.advance();
            }
            Ok(None) => handlers.settle(Ok(values)),
            Err(error) => handlers.settle(Err(error)),
        }
    }
}
